use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl FromStr for Priority {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CRITICAL" => Ok(Priority::Critical),
            "HIGH" => Ok(Priority::High),
            "MEDIUM" => Ok(Priority::Medium),
            "LOW" => Ok(Priority::Low),
            other => Err(BridgeError::Malformed {
                msg: format!("invalid priority: {other}"),
                source: None,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queued (not yet started) calls across all classes.
    pub capacity: usize,
    /// Queued + executing calls a single user may hold.
    pub max_inflight_per_user: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            max_inflight_per_user: 8,
        }
    }
}

struct QueueItem<T> {
    seq: u64,
    user_id: i64,
    upstream_id: String,
    priority: Priority,
    enqueued_at: Instant,
    cancel: CancellationToken,
    grant_tx: oneshot::Sender<T>,
}

/// Holds one unit of a user's in-flight budget for the lifetime of the
/// call (queued and executing).
pub struct UserSlot {
    user_id: i64,
    counts: Arc<DashMap<i64, usize>>,
}

impl Drop for UserSlot {
    fn drop(&mut self) {
        if let Some(mut entry) = self.counts.get_mut(&self.user_id) {
            *entry = entry.saturating_sub(1);
        }
    }
}

/// What the caller holds after a successful enqueue: the grant channel,
/// its queue position, and an estimated wait.
pub struct EnqueuedTicket<T> {
    pub position: usize,
    pub estimated_wait_ms: u64,
    pub cancel: CancellationToken,
    pub grant_rx: oneshot::Receiver<T>,
    _slot: UserSlot,
}

/// What the consumer holds after a pop: enough to acquire a session and
/// hand it to the waiting caller.
pub struct GrantHandle<T> {
    pub user_id: i64,
    pub upstream_id: String,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub cancel: CancellationToken,
    grant_tx: oneshot::Sender<T>,
}

impl<T> GrantHandle<T> {
    /// Hand the acquired resource to the caller. Fails when the caller has
    /// already gone away (deadline or disconnect).
    pub fn grant(self, value: T) -> Result<(), T> {
        self.grant_tx.send(value)
    }
}

/// Bounded priority FIFO. Four classes, strict insertion order within a
/// class, fail-fast on overflow. Admission is decoupled from execution:
/// the consumer pops, acquires a session, and grants it through the
/// ticket's channel.
pub struct RequestQueue<T> {
    config: QueueConfig,
    classes: Mutex<[VecDeque<QueueItem<T>>; Priority::COUNT]>,
    seq: AtomicU64,
    notify: Notify,
    user_counts: Arc<DashMap<i64, usize>>,
    /// Moving average of execution time, for wait estimates.
    avg_exec_ms: AtomicU64,
}

impl<T> RequestQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            classes: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            user_counts: Arc::new(DashMap::new()),
            avg_exec_ms: AtomicU64::new(100),
        }
    }

    pub fn depth(&self) -> usize {
        self.classes.lock().iter().map(VecDeque::len).sum()
    }

    /// Exponential moving average of observed execution times.
    pub fn record_exec_ms(&self, exec_ms: u64) {
        let previous = self.avg_exec_ms.load(Ordering::Relaxed);
        let updated = (previous * 7 + exec_ms) / 8;
        self.avg_exec_ms.store(updated.max(1), Ordering::Relaxed);
    }

    pub fn avg_exec_ms(&self) -> u64 {
        self.avg_exec_ms.load(Ordering::Relaxed)
    }

    pub fn enqueue(
        &self,
        user_id: i64,
        upstream_id: String,
        priority: Priority,
        cancel: CancellationToken,
    ) -> Result<EnqueuedTicket<T>, BridgeError> {
        // Per-user budget before global capacity, so one user cannot learn
        // queue state by overflowing it
        {
            let mut entry = self.user_counts.entry(user_id).or_insert(0);
            if *entry >= self.config.max_inflight_per_user {
                let retry_after_ms = self.avg_exec_ms();
                return Err(BridgeError::RateLimited { retry_after_ms });
            }
            *entry += 1;
        }
        let slot = UserSlot {
            user_id,
            counts: self.user_counts.clone(),
        };

        let (grant_tx, grant_rx) = oneshot::channel();
        let mut classes = self.classes.lock();

        let depth: usize = classes.iter().map(VecDeque::len).sum();
        if depth >= self.config.capacity {
            // slot dropped here, releasing the user budget
            return Err(BridgeError::QueueFull);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let item = QueueItem {
            seq,
            user_id,
            upstream_id,
            priority,
            enqueued_at: Instant::now(),
            cancel: cancel.clone(),
            grant_tx,
        };

        // Position among the items that will start before this one
        let position = classes[..=priority.index()]
            .iter()
            .map(VecDeque::len)
            .sum::<usize>();
        classes[priority.index()].push_back(item);
        drop(classes);

        self.notify.notify_one();

        Ok(EnqueuedTicket {
            position,
            estimated_wait_ms: (position as u64 + 1) * self.avg_exec_ms(),
            cancel,
            grant_rx,
            _slot: slot,
        })
    }

    /// Next item in priority order, skipping entries cancelled while
    /// queued. Within a class the sequence number preserves insertion
    /// order even under concurrent enqueues.
    pub fn pop(&self) -> Option<GrantHandle<T>> {
        let mut classes = self.classes.lock();
        for class in classes.iter_mut() {
            while let Some(item) = class.pop_front() {
                if item.cancel.is_cancelled() || item.grant_tx.is_closed() {
                    continue;
                }
                debug_assert!(
                    class.front().map(|next| next.seq > item.seq).unwrap_or(true)
                );
                return Some(GrantHandle {
                    user_id: item.user_id,
                    upstream_id: item.upstream_id,
                    priority: item.priority,
                    enqueued_at: item.enqueued_at,
                    cancel: item.cancel,
                    grant_tx: item.grant_tx,
                });
            }
        }
        None
    }

    /// Consumer entry point: the next item, or `None` on shutdown.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<GrantHandle<T>> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }
}
