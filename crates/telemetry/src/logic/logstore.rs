use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use shared::primitives::WrappedJsonValue;
use utoipa::ToSchema;

use crate::repository::{NewLogEntry, TelemetryRepositoryLike};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Auth,
    Bridge,
    Queue,
    Pool,
    Cache,
    Breaker,
    Hub,
    Admin,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Auth => "auth",
            LogCategory::Bridge => "bridge",
            LogCategory::Queue => "queue",
            LogCategory::Pool => "pool",
            LogCategory::Cache => "cache",
            LogCategory::Breaker => "breaker",
            LogCategory::Hub => "hub",
            LogCategory::Admin => "admin",
        }
    }
}

/// Structured audit sink: every entry goes to the store (for the admin
/// surface and retention) and to the tracing pipeline (for operators).
#[derive(Clone)]
pub struct LogStore<R: TelemetryRepositoryLike> {
    repository: R,
}

impl<R: TelemetryRepositoryLike> LogStore<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub async fn log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
        fields: serde_json::Value,
    ) {
        let message = message.into();

        match level {
            LogLevel::Debug => {
                tracing::debug!(category = category.as_str(), fields = %fields, "{message}")
            }
            LogLevel::Info => {
                tracing::info!(category = category.as_str(), fields = %fields, "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(category = category.as_str(), fields = %fields, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(category = category.as_str(), fields = %fields, "{message}")
            }
        }

        // A failed audit write must not fail the request it describes.
        let entry = NewLogEntry {
            level,
            category,
            message,
            fields: WrappedJsonValue::new(fields),
        };
        if let Err(e) = self.repository.append_log(&entry).await {
            tracing::error!(error = ?e, "failed to persist log entry");
        }
    }

    pub async fn warn(
        &self,
        category: LogCategory,
        message: impl Into<String>,
        fields: serde_json::Value,
    ) {
        self.log(LogLevel::Warn, category, message, fields).await;
    }

    pub async fn error(
        &self,
        category: LogCategory,
        message: impl Into<String>,
        fields: serde_json::Value,
    ) {
        self.log(LogLevel::Error, category, message, fields).await;
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }
}

/// Digest of an error chain suitable for `error_record.stacktrace_digest`:
/// stable, short, and free of secrets.
pub fn error_digest(err: &BridgeError) -> String {
    use std::error::Error;

    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        chain.push(e.to_string());
        source = e.source();
    }

    let joined = chain.join(" <- ");

    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let digest = hasher.finalize();

    use std::fmt::Write;
    let mut hex = String::with_capacity(16);
    for b in digest.iter().take(8) {
        let _ = write!(hex, "{b:02x}");
    }
    format!("{hex}:{}", chain.len())
}
