pub mod sqlite;

pub use sqlite::Repository;

use std::collections::HashMap;

use serde::Serialize;
use shared::error::BridgeError;
use shared::primitives::{WrappedChronoDateTime, WrappedJsonValue};
use utoipa::ToSchema;

use crate::logic::logstore::{LogCategory, LogLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Ok,
    Err,
    Timeout,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Ok => "ok",
            RequestStatus::Err => "err",
            RequestStatus::Timeout => "timeout",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

/// Row created the moment a call is accepted into the queue.
#[derive(Debug, Clone)]
pub struct NewRequestRecord {
    pub id: String,
    pub client_request_id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<i64>,
    pub tool_name: String,
    pub priority: String,
    pub enqueued_at: WrappedChronoDateTime,
}

/// Completion data written exactly once per accepted call.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub started_at: Option<WrappedChronoDateTime>,
    pub finished_at: WrappedChronoDateTime,
    pub queue_wait_ms: Option<i64>,
    pub exec_ms: Option<i64>,
    pub status: RequestStatus,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RequestRecord {
    pub id: String,
    pub client_request_id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<i64>,
    pub tool_name: String,
    pub priority: String,
    pub enqueued_at: WrappedChronoDateTime,
    pub started_at: Option<WrappedChronoDateTime>,
    pub finished_at: Option<WrappedChronoDateTime>,
    pub queue_wait_ms: Option<i64>,
    pub exec_ms: Option<i64>,
    pub status: String,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    pub fields: WrappedJsonValue,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LogEntry {
    pub id: i64,
    pub level: String,
    pub category: String,
    pub message: String,
    pub fields_json: WrappedJsonValue,
    pub ts: WrappedChronoDateTime,
}

#[derive(Debug, Clone)]
pub struct NewErrorRecord {
    pub id: String,
    pub request_id: Option<String>,
    pub kind: String,
    pub message: String,
    pub stacktrace_digest: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CleanupOutcome {
    pub logs_deleted: u64,
    pub requests_deleted: u64,
    pub errors_deleted: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StoreStats {
    pub requests_total: u64,
    pub requests_by_status: HashMap<String, u64>,
    pub requests_by_tool: HashMap<String, u64>,
    pub log_entries: u64,
    pub error_records: u64,
}

#[allow(async_fn_in_trait)]
pub trait TelemetryRepositoryLike: Clone + Send + Sync + 'static {
    async fn append_log(&self, entry: &NewLogEntry) -> Result<(), BridgeError>;

    async fn list_recent_logs(
        &self,
        limit: i64,
        category: Option<LogCategory>,
    ) -> Result<Vec<LogEntry>, BridgeError>;

    async fn append_request(&self, record: &NewRequestRecord) -> Result<(), BridgeError>;

    async fn finish_request(
        &self,
        id: &str,
        outcome: &RequestOutcome,
    ) -> Result<(), BridgeError>;

    async fn get_request(&self, id: &str) -> Result<Option<RequestRecord>, BridgeError>;

    async fn list_requests_by_client_id(
        &self,
        client_request_id: &str,
    ) -> Result<Vec<RequestRecord>, BridgeError>;

    async fn append_error(&self, record: &NewErrorRecord) -> Result<(), BridgeError>;

    /// Delete log entries, request records and error records older than the
    /// horizon in one transaction. Running it twice with no new writes is a
    /// no-op the second time.
    async fn cleanup(&self, before: WrappedChronoDateTime)
    -> Result<CleanupOutcome, BridgeError>;

    /// Reclaim file space after a cleanup.
    async fn vacuum(&self) -> Result<(), BridgeError>;

    async fn stats(&self) -> Result<StoreStats, BridgeError>;
}
