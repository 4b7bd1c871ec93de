use std::{env, str::FromStr};

use tracing::warn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initialize the tracing subscriber: stdout plus an optional secondary
/// writer (the rotating bridge log file). Safe to call more than once;
/// later calls are ignored with a warning.
pub fn configure_logging<W>(file_writer: Option<W>) -> Result<(), anyhow::Error>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let rust_log = env::var("RUST_LOG").unwrap_or("info".to_string());
    let filter = EnvFilter::from_str(rust_log.as_str())?;
    let json = env::var("LOG_FORMAT").unwrap_or("text".to_string()) == "json";

    let stdout_layer = if json {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_file(true)
            .with_line_number(true)
            .json()
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .boxed()
    });

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    if let Err(e) = result {
        warn!(
            "Failed to initialize logging, potentially because we have initialized logging already: {}",
            e
        );
    }

    Ok(())
}

/// Stdout-only convenience used by tests and the admin CLI commands.
pub fn configure_stdout_logging() -> Result<(), anyhow::Error> {
    configure_logging(None::<fn() -> std::io::Stdout>)
}
