use std::collections::HashMap;

use anyhow::Context;
use shared::error::BridgeError;
use shared::libsql::Migration;
use shared::primitives::WrappedChronoDateTime;

use crate::logic::logstore::LogCategory;
use crate::repository::{
    CleanupOutcome, LogEntry, NewErrorRecord, NewLogEntry, NewRequestRecord, RequestOutcome,
    RequestRecord, StoreStats, TelemetryRepositoryLike,
};

#[derive(Clone)]
pub struct Repository {
    conn: shared::libsql::Connection,
}

impl Repository {
    pub fn new(conn: shared::libsql::Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &shared::libsql::Connection {
        &self.conn
    }

    pub fn migrations() -> Vec<Migration> {
        vec![Migration {
            version: "0004_telemetry",
            sql: "CREATE TABLE IF NOT EXISTS request_record (
                id TEXT PRIMARY KEY,
                client_request_id TEXT,
                session_id TEXT,
                user_id INTEGER,
                tool_name TEXT NOT NULL,
                priority TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                queue_wait_ms INTEGER,
                exec_ms INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                error_code TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_request_record_enqueued
                ON request_record (enqueued_at);
            CREATE INDEX IF NOT EXISTS idx_request_record_client_id
                ON request_record (client_request_id);
            CREATE TABLE IF NOT EXISTS error_record (
                id TEXT PRIMARY KEY,
                request_id TEXT,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                stacktrace_digest TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_error_record_ts ON error_record (ts);
            CREATE TABLE IF NOT EXISTS log_entry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level TEXT NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                fields_json TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_log_entry_ts ON log_entry (ts);
            CREATE INDEX IF NOT EXISTS idx_log_entry_category ON log_entry (category)",
        }]
    }
}

fn repo_err(e: anyhow::Error) -> BridgeError {
    BridgeError::Repository {
        msg: e.to_string(),
        source: Some(e),
    }
}

const REQUEST_COLUMNS: &str = "id, client_request_id, session_id, user_id, tool_name, priority, \
     enqueued_at, started_at, finished_at, queue_wait_ms, exec_ms, status, error_code";

fn row_to_request(row: &libsql::Row) -> Result<RequestRecord, BridgeError> {
    let opt_dt = |raw: Option<String>| -> Result<Option<WrappedChronoDateTime>, BridgeError> {
        raw.map(WrappedChronoDateTime::try_from)
            .transpose()
            .map_err(|e| BridgeError::Repository {
                msg: "invalid datetime in request_record".to_string(),
                source: Some(e),
            })
    };

    Ok(RequestRecord {
        id: row.get(0)?,
        client_request_id: row.get(1)?,
        session_id: row.get(2)?,
        user_id: row.get(3)?,
        tool_name: row.get(4)?,
        priority: row.get(5)?,
        enqueued_at: row.get(6)?,
        started_at: opt_dt(row.get(7)?)?,
        finished_at: opt_dt(row.get(8)?)?,
        queue_wait_ms: row.get(9)?,
        exec_ms: row.get(10)?,
        status: row.get(11)?,
        error_code: row.get(12)?,
    })
}

impl TelemetryRepositoryLike for Repository {
    async fn append_log(&self, entry: &NewLogEntry) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "INSERT INTO log_entry (level, category, message, fields_json, ts)
                 VALUES (?, ?, ?, ?, ?)",
                libsql::params![
                    entry.level.as_str(),
                    entry.category.as_str(),
                    entry.message.clone(),
                    entry.fields.clone(),
                    WrappedChronoDateTime::now(),
                ],
            )
            .await
            .context("Failed to append log entry")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn list_recent_logs(
        &self,
        limit: i64,
        category: Option<LogCategory>,
    ) -> Result<Vec<LogEntry>, BridgeError> {
        let mut rows = match category {
            Some(category) => {
                self.conn
                    .query(
                        "SELECT id, level, category, message, fields_json, ts FROM log_entry
                         WHERE category = ? ORDER BY id DESC LIMIT ?",
                        libsql::params![category.as_str(), limit],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(
                        "SELECT id, level, category, message, fields_json, ts FROM log_entry
                         ORDER BY id DESC LIMIT ?",
                        libsql::params![limit],
                    )
                    .await?
            }
        };

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(LogEntry {
                id: row.get(0)?,
                level: row.get(1)?,
                category: row.get(2)?,
                message: row.get(3)?,
                fields_json: row.get(4)?,
                ts: row.get(5)?,
            });
        }
        Ok(entries)
    }

    async fn append_request(&self, record: &NewRequestRecord) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "INSERT INTO request_record
                     (id, client_request_id, session_id, user_id, tool_name, priority, enqueued_at, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 'pending')",
                libsql::params![
                    record.id.clone(),
                    record.client_request_id.clone(),
                    record.session_id.clone(),
                    record.user_id,
                    record.tool_name.clone(),
                    record.priority.clone(),
                    record.enqueued_at,
                ],
            )
            .await
            .context("Failed to append request record")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn finish_request(
        &self,
        id: &str,
        outcome: &RequestOutcome,
    ) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "UPDATE request_record
                 SET started_at = ?, finished_at = ?, queue_wait_ms = ?, exec_ms = ?,
                     status = ?, error_code = ?
                 WHERE id = ?",
                libsql::params![
                    outcome.started_at.map(libsql::Value::from),
                    outcome.finished_at,
                    outcome.queue_wait_ms,
                    outcome.exec_ms,
                    outcome.status.as_str(),
                    outcome.error_code.clone(),
                    id,
                ],
            )
            .await
            .context("Failed to finish request record")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn get_request(&self, id: &str) -> Result<Option<RequestRecord>, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                &format!("SELECT {REQUEST_COLUMNS} FROM request_record WHERE id = ?"),
                [id],
            )
            .await?;
        row.as_ref().map(row_to_request).transpose()
    }

    async fn list_requests_by_client_id(
        &self,
        client_request_id: &str,
    ) -> Result<Vec<RequestRecord>, BridgeError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM request_record
                     WHERE client_request_id = ? ORDER BY enqueued_at ASC"
                ),
                [client_request_id],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_request(&row)?);
        }
        Ok(records)
    }

    async fn append_error(&self, record: &NewErrorRecord) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "INSERT INTO error_record (id, request_id, kind, message, stacktrace_digest, ts)
                 VALUES (?, ?, ?, ?, ?, ?)",
                libsql::params![
                    record.id.clone(),
                    record.request_id.clone(),
                    record.kind.clone(),
                    record.message.clone(),
                    record.stacktrace_digest.clone(),
                    WrappedChronoDateTime::now(),
                ],
            )
            .await
            .context("Failed to append error record")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn cleanup(
        &self,
        before: WrappedChronoDateTime,
    ) -> Result<CleanupOutcome, BridgeError> {
        let tx = self.conn.transaction().await?;

        let logs_deleted = tx
            .execute("DELETE FROM log_entry WHERE ts < ?", libsql::params![before])
            .await?;
        let requests_deleted = tx
            .execute(
                "DELETE FROM request_record WHERE enqueued_at < ?",
                libsql::params![before],
            )
            .await?;
        let errors_deleted = tx
            .execute("DELETE FROM error_record WHERE ts < ?", libsql::params![before])
            .await?;

        tx.commit().await?;

        Ok(CleanupOutcome {
            logs_deleted,
            requests_deleted,
            errors_deleted,
        })
    }

    async fn vacuum(&self) -> Result<(), BridgeError> {
        self.conn.execute("VACUUM", ()).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, BridgeError> {
        let count = |sql: &'static str| {
            let conn = self.conn.clone();
            async move {
                let row = conn.query_row_opt(sql, ()).await?;
                Ok::<u64, BridgeError>(match row {
                    Some(row) => row.get::<i64>(0)? as u64,
                    None => 0,
                })
            }
        };

        let requests_total = count("SELECT COUNT(*) FROM request_record").await?;
        let log_entries = count("SELECT COUNT(*) FROM log_entry").await?;
        let error_records = count("SELECT COUNT(*) FROM error_record").await?;

        let mut requests_by_status = HashMap::new();
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM request_record GROUP BY status",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            requests_by_status.insert(row.get::<String>(0)?, row.get::<i64>(1)? as u64);
        }

        let mut requests_by_tool = HashMap::new();
        let mut rows = self
            .conn
            .query(
                "SELECT tool_name, COUNT(*) FROM request_record GROUP BY tool_name",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            requests_by_tool.insert(row.get::<String>(0)?, row.get::<i64>(1)? as u64);
        }

        Ok(StoreStats {
            requests_total,
            requests_by_status,
            requests_by_tool,
            log_entries,
            error_records,
        })
    }
}
