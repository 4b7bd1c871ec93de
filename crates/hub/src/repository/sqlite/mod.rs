use encryption::logic::EncryptedString;
use shared::error::BridgeError;
use shared::libsql::Migration;
use shared::primitives::WrappedChronoDateTime;

use crate::repository::{HubConfig, HubConfigRepositoryLike, ProbeRecord};

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
            version: "0003_hub",
            sql: "CREATE TABLE IF NOT EXISTS hub_config (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES user (id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                token_cipher TEXT NOT NULL,
                last_probe_at TEXT,
                last_probe_status TEXT,
                last_probe_latency_ms INTEGER,
                last_probe_version TEXT,
                last_probe_entities INTEGER,
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (user_id, name)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_hub_config_default
                ON hub_config (user_id) WHERE is_default = 1",
        }]
    }
}

fn opt_dt(raw: Option<String>) -> Result<Option<WrappedChronoDateTime>, BridgeError> {
    raw.map(WrappedChronoDateTime::try_from)
        .transpose()
        .map_err(|e| BridgeError::Repository {
            msg: "invalid datetime column".to_string(),
            source: Some(e),
        })
}

const CONFIG_COLUMNS: &str = "id, user_id, name, url, token_cipher, last_probe_at, \
     last_probe_status, last_probe_latency_ms, last_probe_version, last_probe_entities, \
     is_default, created_at";

fn row_to_config(row: &libsql::Row) -> Result<HubConfig, BridgeError> {
    Ok(HubConfig {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        token_cipher: row.get(4)?,
        last_probe_at: opt_dt(row.get(5)?)?,
        last_probe_status: row.get(6)?,
        last_probe_latency_ms: row.get(7)?,
        last_probe_version: row.get(8)?,
        last_probe_entities: row.get(9)?,
        is_default: row.get::<i64>(10)? != 0,
        created_at: row.get(11)?,
    })
}

impl HubConfigRepositoryLike for Repository {
    async fn insert_config(&self, config: &HubConfig) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "INSERT INTO hub_config
                     (id, user_id, name, url, token_cipher, is_default, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    config.id.clone(),
                    config.user_id,
                    config.name.clone(),
                    config.url.clone(),
                    config.token_cipher.clone(),
                    config.is_default as i64,
                    config.created_at,
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE constraint failed") {
                    BridgeError::Conflict {
                        msg: "a hub config with this name already exists".to_string(),
                    }
                } else {
                    BridgeError::from(e)
                }
            })?;
        Ok(())
    }

    async fn update_config(
        &self,
        id: &str,
        user_id: i64,
        name: &str,
        url: &str,
        token_cipher: Option<&EncryptedString>,
    ) -> Result<(), BridgeError> {
        let changed = match token_cipher {
            Some(cipher) => {
                self.conn
                    .execute(
                        "UPDATE hub_config SET name = ?, url = ?, token_cipher = ?
                         WHERE id = ? AND user_id = ?",
                        libsql::params![name, url, cipher.clone(), id, user_id],
                    )
                    .await?
            }
            None => {
                self.conn
                    .execute(
                        "UPDATE hub_config SET name = ?, url = ? WHERE id = ? AND user_id = ?",
                        libsql::params![name, url, id, user_id],
                    )
                    .await?
            }
        };

        if changed == 0 {
            return Err(BridgeError::NotFound {
                msg: "hub config not found".to_string(),
                lookup_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_config(&self, id: &str, user_id: i64) -> Result<(), BridgeError> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM hub_config WHERE id = ? AND user_id = ?",
                libsql::params![id, user_id],
            )
            .await?;
        if changed == 0 {
            return Err(BridgeError::NotFound {
                msg: "hub config not found".to_string(),
                lookup_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_config(
        &self,
        id: &str,
        user_id: i64,
    ) -> Result<Option<HubConfig>, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                &format!("SELECT {CONFIG_COLUMNS} FROM hub_config WHERE id = ? AND user_id = ?"),
                libsql::params![id, user_id],
            )
            .await?;
        row.as_ref().map(row_to_config).transpose()
    }

    async fn list_configs_for_user(&self, user_id: i64) -> Result<Vec<HubConfig>, BridgeError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CONFIG_COLUMNS} FROM hub_config WHERE user_id = ?
                     ORDER BY created_at ASC"
                ),
                [user_id],
            )
            .await?;

        let mut configs = Vec::new();
        while let Some(row) = rows.next().await? {
            configs.push(row_to_config(&row)?);
        }
        Ok(configs)
    }

    async fn list_all_configs(&self) -> Result<Vec<HubConfig>, BridgeError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CONFIG_COLUMNS} FROM hub_config ORDER BY created_at ASC"),
                (),
            )
            .await?;

        let mut configs = Vec::new();
        while let Some(row) = rows.next().await? {
            configs.push(row_to_config(&row)?);
        }
        Ok(configs)
    }

    async fn set_default_config(&self, user_id: i64, id: &str) -> Result<(), BridgeError> {
        let tx = self.conn.transaction().await?;

        // Clear-then-set keeps the partial unique index satisfied at commit
        tx.execute(
            "UPDATE hub_config SET is_default = 0 WHERE user_id = ? AND is_default = 1",
            libsql::params![user_id],
        )
        .await?;
        let changed = tx
            .execute(
                "UPDATE hub_config SET is_default = 1 WHERE id = ? AND user_id = ?",
                libsql::params![id, user_id],
            )
            .await?;

        if changed == 0 {
            tx.rollback().await?;
            return Err(BridgeError::NotFound {
                msg: "hub config not found".to_string(),
                lookup_id: id.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_default_config(
        &self,
        user_id: i64,
    ) -> Result<Option<HubConfig>, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                &format!(
                    "SELECT {CONFIG_COLUMNS} FROM hub_config
                     WHERE user_id = ? AND is_default = 1"
                ),
                [user_id],
            )
            .await?;
        row.as_ref().map(row_to_config).transpose()
    }

    async fn record_probe(&self, id: &str, probe: &ProbeRecord) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "UPDATE hub_config
                 SET last_probe_at = ?, last_probe_status = ?, last_probe_latency_ms = ?,
                     last_probe_version = ?, last_probe_entities = ?
                 WHERE id = ?",
                libsql::params![
                    probe.at,
                    probe.status.clone(),
                    probe.latency_ms,
                    probe.version.clone(),
                    probe.entities,
                    id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_token_cipher(
        &self,
        id: &str,
        token_cipher: &EncryptedString,
    ) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "UPDATE hub_config SET token_cipher = ? WHERE id = ?",
                libsql::params![token_cipher.clone(), id],
            )
            .await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use identity::logic::user::{CreateUserParams, create_user};

    async fn setup() -> (Repository, i64) {
        shared::setup_test!();
        let (_db, conn) = shared::test_utils::repository::setup_in_memory_database(vec![
            identity::repository::Repository::migrations(),
            Repository::migrations(),
        ])
        .await
        .unwrap();

        let users = identity::repository::Repository::new(conn.clone());
        let user = create_user(
            &users,
            CreateUserParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password: "Correct123".into(),
                is_admin: false,
            },
        )
        .await
        .unwrap();

        (Repository::new(conn), user.id)
    }

    fn config(user_id: i64, name: &str) -> HubConfig {
        HubConfig {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            name: name.to_string(),
            url: "http://hub.local:8123".to_string(),
            token_cipher: EncryptedString("ciphertext".to_string()),
            last_probe_at: None,
            last_probe_status: None,
            last_probe_latency_ms: None,
            last_probe_version: None,
            last_probe_entities: None,
            is_default: false,
            created_at: WrappedChronoDateTime::now(),
        }
    }

    #[tokio::test]
    async fn set_default_clears_others_atomically() {
        let (repo, user_id) = setup().await;

        let a = config(user_id, "living-room");
        let b = config(user_id, "garage");
        repo.insert_config(&a).await.unwrap();
        repo.insert_config(&b).await.unwrap();

        repo.set_default_config(user_id, &a.id).await.unwrap();
        assert_eq!(repo.get_default_config(user_id).await.unwrap().unwrap().id, a.id);

        // setDefault(b) moves the flag
        repo.set_default_config(user_id, &b.id).await.unwrap();
        assert_eq!(repo.get_default_config(user_id).await.unwrap().unwrap().id, b.id);

        // setDefault is idempotent
        repo.set_default_config(user_id, &b.id).await.unwrap();
        assert_eq!(repo.get_default_config(user_id).await.unwrap().unwrap().id, b.id);

        // Never more than one default
        let defaults: usize = repo
            .list_configs_for_user(user_id)
            .await
            .unwrap()
            .iter()
            .filter(|c| c.is_default)
            .count();
        assert_eq!(defaults, 1);
    }

    #[tokio::test]
    async fn set_default_on_missing_config_rolls_back() {
        let (repo, user_id) = setup().await;

        let a = config(user_id, "living-room");
        repo.insert_config(&a).await.unwrap();
        repo.set_default_config(user_id, &a.id).await.unwrap();

        let missing = repo.set_default_config(user_id, "no-such-id").await;
        assert!(matches!(missing, Err(BridgeError::NotFound { .. })));

        // The previous default survived the failed call
        assert_eq!(repo.get_default_config(user_id).await.unwrap().unwrap().id, a.id);
    }

    #[tokio::test]
    async fn duplicate_name_per_user_is_a_conflict() {
        let (repo, user_id) = setup().await;

        repo.insert_config(&config(user_id, "home")).await.unwrap();
        let dup = repo.insert_config(&config(user_id, "home")).await;
        assert!(matches!(dup, Err(BridgeError::Conflict { .. })));
    }

    #[tokio::test]
    async fn probe_results_are_recorded() {
        let (repo, user_id) = setup().await;

        let c = config(user_id, "home");
        repo.insert_config(&c).await.unwrap();

        repo.record_probe(
            &c.id,
            &ProbeRecord {
                at: WrappedChronoDateTime::now(),
                status: "ok".to_string(),
                latency_ms: Some(42),
                version: Some("2026.7.1".to_string()),
                entities: Some(128),
            },
        )
        .await
        .unwrap();

        let fetched = repo.get_config(&c.id, user_id).await.unwrap().unwrap();
        assert_eq!(fetched.last_probe_status.as_deref(), Some("ok"));
        assert_eq!(fetched.last_probe_latency_ms, Some(42));
        assert_eq!(fetched.last_probe_entities, Some(128));
    }

    #[tokio::test]
    async fn configs_are_scoped_to_their_owner() {
        let (repo, user_id) = setup().await;

        let c = config(user_id, "home");
        repo.insert_config(&c).await.unwrap();

        // Another user id sees nothing
        assert!(repo.get_config(&c.id, user_id + 1).await.unwrap().is_none());
        assert!(repo.delete_config(&c.id, user_id + 1).await.is_err());
    }
}
