use std::ops::Deref;
use std::path::Path;

use crate::error::BridgeError;
use libsql::params::IntoParams;
use libsql::{BatchRows, Database, Rows};
use tracing::info;

#[derive(Debug, Clone)]
pub struct Connection(pub libsql::Connection);

impl Connection {
    pub fn new(connection: libsql::Connection) -> Self {
        Self(connection)
    }
}

impl Deref for Connection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! execute_with_retry {
    ($operation:expr) => {
        execute_with_retry!($operation, 10)
    };
    ($operation:expr, $max_retries:expr) => {{
        async {
            let mut _retries = 0u32;
            let _max_retries: u32 = $max_retries;

            loop {
                match $operation.await {
                    Ok(result) => break Ok(result),
                    Err(err) => {
                        let err_str = err.to_string();
                        if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY")
                        {
                            tracing::warn!("Database is locked, retrying... {:?}", err);
                            if _retries >= _max_retries {
                                break Err(err);
                            }

                            _retries += 1;

                            // Very low delay with exponential backoff
                            let delay_us = 10_000 * (1 << _retries.min(6));
                            tokio::time::sleep(std::time::Duration::from_micros(delay_us)).await;
                        } else {
                            tracing::error!("Error executing with retry: {:?}", err);
                            break Err(err);
                        }
                    }
                }
            }
        }
        .await
    }};
}

impl Connection {
    /// Execute a sql statement, retrying while the database is busy.
    /// Returns the number of rows that were changed.
    pub async fn execute(&self, sql: &str, params: impl IntoParams) -> libsql::Result<u64> {
        tracing::trace!("executing `{}`", sql);
        let params = params.into_params()?;
        execute_with_retry!(self.0.execute(sql, params.clone()), 10)
    }

    /// Execute a batch set of statements.
    pub async fn execute_batch(&self, sql: &str) -> libsql::Result<BatchRows> {
        tracing::trace!("executing batch `{}`", sql);
        execute_with_retry!(self.0.execute_batch(sql), 10)
    }

    /// Execute a batch set of statements atomically in a transaction.
    pub async fn execute_transactional_batch(&self, sql: &str) -> libsql::Result<BatchRows> {
        tracing::trace!("executing batch transactional `{}`", sql);
        execute_with_retry!(self.0.execute_transactional_batch(sql), 10)
    }

    /// Run a query, retrying while the database is busy, returning the [`Rows`].
    pub async fn query(&self, sql: &str, params: impl IntoParams) -> libsql::Result<Rows> {
        let stmt = self.prepare(sql).await?;
        let params = params.into_params()?;
        execute_with_retry!(stmt.query(params.clone()), 10)
    }

    /// Run a query expected to return at most one row.
    pub async fn query_row_opt(
        &self,
        sql: &str,
        params: impl IntoParams,
    ) -> libsql::Result<Option<libsql::Row>> {
        let mut rows = self.query(sql, params).await?;
        rows.next().await
    }
}

/// A single schema migration. Versions are ordered lexically, so they carry
/// a zero-padded numeric prefix (`0001_identity`).
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: &'static str,
    pub sql: &'static str,
}

/// Implemented by every repository that owns part of the schema.
pub trait SqlMigrationSource {
    fn migrations() -> Vec<Migration>;
}

/// Merge per-crate migration sets into one linear sequence.
///
/// Duplicate versions are a programmer error and fail loudly at startup
/// rather than silently skipping a migration.
pub fn merge_migrations(sets: Vec<Vec<Migration>>) -> Result<Vec<Migration>, BridgeError> {
    let mut merged: Vec<Migration> = sets.into_iter().flatten().collect();
    merged.sort_by(|a, b| a.version.cmp(b.version));

    for pair in merged.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(BridgeError::internal(format!(
                "duplicate migration version: {}",
                pair[0].version
            )));
        }
    }

    Ok(merged)
}

/// Apply every migration that is not yet recorded in `schema_migrations`,
/// in version order, each inside its own transaction. Returns the number of
/// migrations applied.
pub async fn run_migrations(
    conn: &Connection,
    migrations: Vec<Migration>,
) -> Result<u32, BridgeError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .await?;

    let mut applied = 0u32;
    for migration in migrations {
        let existing = conn
            .query_row_opt(
                "SELECT version FROM schema_migrations WHERE version = ?",
                [migration.version],
            )
            .await?;
        if existing.is_some() {
            continue;
        }

        info!(version = migration.version, "applying migration");
        let batch = format!(
            "{};\nINSERT INTO schema_migrations (version, applied_at) VALUES ('{}', datetime('now'));",
            migration.sql.trim_end_matches(['\n', ';']),
            migration.version
        );
        conn.execute_transactional_batch(&batch)
            .await
            .map_err(|e| BridgeError::Repository {
                msg: format!("migration {} failed", migration.version),
                source: Some(anyhow::Error::from(e)),
            })?;
        applied += 1;
    }

    Ok(applied)
}

/// Open (or create) the local database file and return a connection with
/// foreign keys enabled.
pub async fn open_database(path: &Path) -> Result<(Database, Connection), BridgeError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!(path = %path.display(), "opening local database");
    let db = libsql::Builder::new_local(path).build().await?;
    let conn = Connection(db.connect()?);
    conn.execute("PRAGMA foreign_keys = ON", ()).await?;

    Ok((db, conn))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(version: &'static str) -> Migration {
        Migration {
            version,
            sql: "CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY)",
        }
    }

    #[test]
    fn merge_orders_by_version() {
        let merged = merge_migrations(vec![
            vec![fixture("0002_b")],
            vec![fixture("0001_a"), fixture("0003_c")],
        ])
        .unwrap();
        let versions: Vec<_> = merged.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec!["0001_a", "0002_b", "0003_c"]);
    }

    #[test]
    fn merge_rejects_duplicate_versions() {
        let result = merge_migrations(vec![vec![fixture("0001_a")], vec![fixture("0001_a")]]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn migrations_apply_once() {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        let conn = Connection(db.connect().unwrap());

        let migrations = vec![Migration {
            version: "0001_test",
            sql: "CREATE TABLE widget (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        }];

        let applied = run_migrations(&conn, migrations.clone()).await.unwrap();
        assert_eq!(applied, 1);

        // Second run is a no-op
        let applied = run_migrations(&conn, migrations).await.unwrap();
        assert_eq!(applied, 0);

        conn.execute("INSERT INTO widget (name) VALUES (?)", ["a"])
            .await
            .unwrap();
    }
}
