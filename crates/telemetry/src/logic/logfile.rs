use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use shared::error::BridgeError;

/// Writer behind the tracing file layer. Produces
/// `logs/bridge_YYYY-MM-DD.log`, switching files when the date changes.
/// Manual rotation (the admin endpoint) archives the active file under a
/// timestamped name and reopens a fresh one.
#[derive(Clone)]
pub struct RotatingLogWriter {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    dir: PathBuf,
    date: NaiveDate,
    file: Option<File>,
    max_archives: usize,
}

fn file_name_for(date: NaiveDate) -> String {
    format!("bridge_{}.log", date.format("%Y-%m-%d"))
}

impl RotatingLogWriter {
    pub fn new(dir: impl Into<PathBuf>, max_archives: usize) -> Result<Self, BridgeError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                dir,
                date: Utc::now().date_naive(),
                file: None,
                max_archives,
            })),
        })
    }

    pub fn active_path(&self) -> PathBuf {
        let inner = self.inner.lock();
        inner.dir.join(file_name_for(inner.date))
    }

    /// Roll over to a new dated file if the calendar day changed since the
    /// active file was opened. Called periodically by the log rotator.
    pub fn rotate_if_date_changed(&self) -> Result<bool, BridgeError> {
        let today = Utc::now().date_naive();
        let mut inner = self.inner.lock();
        if inner.date == today {
            return Ok(false);
        }
        inner.file = None;
        inner.date = today;
        prune_archives(&inner.dir, inner.max_archives)?;
        Ok(true)
    }

    /// Archive the active file under a timestamped name and start a fresh
    /// one. Returns the path of the new active file.
    pub fn rotate_now(&self) -> Result<PathBuf, BridgeError> {
        let mut inner = self.inner.lock();
        inner.file = None;

        let now = Utc::now();
        let active = inner.dir.join(file_name_for(inner.date));
        if active.exists() {
            let archived = inner.dir.join(format!(
                "bridge_{}_{}.log",
                inner.date.format("%Y-%m-%d"),
                now.format("%H%M%S")
            ));
            fs::rename(&active, &archived)?;
        }

        inner.date = now.date_naive();
        let new_active = inner.dir.join(file_name_for(inner.date));
        prune_archives(&inner.dir, inner.max_archives)?;
        Ok(new_active)
    }
}

/// Delete the oldest non-active log files beyond `max_archives`.
fn prune_archives(dir: &Path, max_archives: usize) -> Result<(), BridgeError> {
    let active = file_name_for(Utc::now().date_naive());

    let mut archives: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("bridge_") && n.ends_with(".log") && n != active)
                .unwrap_or(false)
        })
        .collect();

    // Names embed the date (and rotation time), so lexical order is age order
    archives.sort();

    while archives.len() > max_archives {
        let oldest = archives.remove(0);
        fs::remove_file(&oldest)?;
    }

    Ok(())
}

impl Inner {
    fn ensure_file(&mut self) -> std::io::Result<&mut File> {
        let today = Utc::now().date_naive();
        if self.date != today {
            self.file = None;
            self.date = today;
            let _ = prune_archives(&self.dir, self.max_archives);
        }

        match &mut self.file {
            Some(file) => Ok(file),
            slot => {
                let path = self.dir.join(file_name_for(self.date));
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(slot.insert(file))
            }
        }
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.ensure_file()?.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        match inner.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingLogWriter {
    type Writer = RotatingLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
