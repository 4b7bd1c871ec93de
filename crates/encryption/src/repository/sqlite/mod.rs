use std::str::FromStr;

use anyhow::Context;
use shared::error::BridgeError;
use shared::libsql::Migration;
use shared::primitives::WrappedChronoDateTime;

use crate::logic::keys::KeyPurpose;
use crate::repository::{SystemKey, SystemKeyRepositoryLike};

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
            version: "0001_system_keys",
            sql: "CREATE TABLE IF NOT EXISTS system_key (
                key_id TEXT PRIMARY KEY,
                purpose TEXT NOT NULL,
                secret TEXT NOT NULL,
                kdf_salt TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                rotated_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_system_key_active
                ON system_key (purpose) WHERE active = 1",
        }]
    }
}

fn row_to_key(row: &libsql::Row) -> Result<SystemKey, BridgeError> {
    let purpose_raw: String = row.get(1)?;
    let rotated_at: Option<String> = row.get(6)?;
    Ok(SystemKey {
        key_id: row.get(0)?,
        purpose: KeyPurpose::from_str(&purpose_raw)?,
        secret: row.get(2)?,
        kdf_salt: row.get(3)?,
        active: row.get::<i64>(4)? != 0,
        created_at: row.get(5)?,
        rotated_at: rotated_at
            .map(|raw| WrappedChronoDateTime::try_from(raw))
            .transpose()
            .map_err(|e| BridgeError::Repository {
                msg: "invalid rotated_at".to_string(),
                source: Some(e),
            })?,
    })
}

const KEY_COLUMNS: &str = "key_id, purpose, secret, kdf_salt, active, created_at, rotated_at";

impl SystemKeyRepositoryLike for Repository {
    async fn get_active_key(
        &self,
        purpose: KeyPurpose,
    ) -> Result<Option<SystemKey>, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                &format!("SELECT {KEY_COLUMNS} FROM system_key WHERE purpose = ? AND active = 1"),
                [purpose.as_str()],
            )
            .await
            .context("Failed to get active system key")
            .map_err(|e| BridgeError::Repository {
                msg: e.to_string(),
                source: Some(e),
            })?;

        row.as_ref().map(row_to_key).transpose()
    }

    async fn insert_key(&self, key: &SystemKey) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "INSERT INTO system_key (key_id, purpose, secret, kdf_salt, active, created_at, rotated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    key.key_id.clone(),
                    key.purpose.as_str(),
                    key.secret.clone(),
                    key.kdf_salt.clone(),
                    key.active as i64,
                    key.created_at,
                    key.rotated_at.map(libsql::Value::from),
                ],
            )
            .await
            .context("Failed to insert system key")
            .map_err(|e| BridgeError::Repository {
                msg: e.to_string(),
                source: Some(e),
            })?;
        Ok(())
    }

    async fn replace_active_key(
        &self,
        purpose: KeyPurpose,
        old_key_id: Option<&str>,
        new: &SystemKey,
    ) -> Result<(), BridgeError> {
        let tx = self.conn.transaction().await?;

        if let Some(old_key_id) = old_key_id {
            tx.execute(
                "UPDATE system_key SET active = 0, rotated_at = ? WHERE key_id = ?",
                libsql::params![WrappedChronoDateTime::now(), old_key_id],
            )
            .await?;
        }

        tx.execute(
            "INSERT INTO system_key (key_id, purpose, secret, kdf_salt, active, created_at, rotated_at)
             VALUES (?, ?, ?, ?, 1, ?, NULL)",
            libsql::params![
                new.key_id.clone(),
                purpose.as_str(),
                new.secret.clone(),
                new.kdf_salt.clone(),
                new.created_at,
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<SystemKey>, BridgeError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {KEY_COLUMNS} FROM system_key ORDER BY created_at ASC"),
                (),
            )
            .await?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await? {
            keys.push(row_to_key(&row)?);
        }
        Ok(keys)
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::keys::generate_system_key;

    async fn setup_test_db() -> Repository {
        shared::setup_test!();

        let (_db, conn) =
            shared::test_utils::repository::setup_in_memory_database(vec![Repository::migrations()])
                .await
                .unwrap();

        Repository::new(conn)
    }

    #[tokio::test]
    async fn insert_and_get_active_key() {
        let repo = setup_test_db().await;

        let key = generate_system_key(KeyPurpose::HubTokenEncryption);
        repo.insert_key(&key).await.unwrap();

        let fetched = repo
            .get_active_key(KeyPurpose::HubTokenEncryption)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.key_id, key.key_id);
        assert!(fetched.active);
        assert!(fetched.kdf_salt.is_some());

        // Other purpose is unaffected
        assert!(
            repo.get_active_key(KeyPurpose::JwtSigning)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn replace_active_key_swaps_atomically() {
        let repo = setup_test_db().await;

        let old = generate_system_key(KeyPurpose::JwtSigning);
        repo.insert_key(&old).await.unwrap();

        let new = generate_system_key(KeyPurpose::JwtSigning);
        repo.replace_active_key(KeyPurpose::JwtSigning, Some(&old.key_id), &new)
            .await
            .unwrap();

        let active = repo
            .get_active_key(KeyPurpose::JwtSigning)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.key_id, new.key_id);

        let keys = repo.list_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        let old_row = keys.iter().find(|k| k.key_id == old.key_id).unwrap();
        assert!(!old_row.active);
        assert!(old_row.rotated_at.is_some());
    }

    #[tokio::test]
    async fn second_active_key_per_purpose_is_rejected() {
        let repo = setup_test_db().await;

        repo.insert_key(&generate_system_key(KeyPurpose::JwtSigning))
            .await
            .unwrap();
        let second = repo
            .insert_key(&generate_system_key(KeyPurpose::JwtSigning))
            .await;
        assert!(second.is_err());
    }
}
