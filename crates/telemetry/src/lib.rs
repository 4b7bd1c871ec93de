pub mod logic;
pub mod repository;

pub use logic::logstore::{LogCategory, LogLevel, LogStore};
pub use logic::metrics::Metrics;
