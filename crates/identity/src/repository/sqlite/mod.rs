use anyhow::Context;
use shared::error::BridgeError;
use shared::libsql::Migration;
use shared::primitives::WrappedChronoDateTime;

use crate::repository::{
    ApiToken, EffectivePermission, NewUser, PermissionBits, PermissionSource, Session,
    SessionRotation, ToolPermission, User, UserRepositoryLike,
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
            version: "0002_identity",
            sql: "CREATE TABLE IF NOT EXISTS user (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                is_disabled INTEGER NOT NULL DEFAULT 0,
                must_rotate_password INTEGER NOT NULL DEFAULT 0,
                failed_logins INTEGER NOT NULL DEFAULT 0,
                locked_until TEXT,
                last_failed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS session (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES user (id) ON DELETE CASCADE,
                access_token_jti TEXT NOT NULL,
                refresh_token_hash TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                refresh_expires_at TEXT NOT NULL,
                user_agent TEXT,
                remote_addr TEXT,
                revoked INTEGER NOT NULL DEFAULT 0,
                CHECK (expires_at > issued_at),
                CHECK (refresh_expires_at >= expires_at)
            );
            CREATE INDEX IF NOT EXISTS idx_session_jti ON session (access_token_jti);
            CREATE INDEX IF NOT EXISTS idx_session_refresh ON session (refresh_token_hash);
            CREATE INDEX IF NOT EXISTS idx_session_user ON session (user_id);
            CREATE TABLE IF NOT EXISTS api_token (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES user (id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                prefix TEXT NOT NULL,
                permissions_json TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                last_used_at TEXT,
                revoked INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS tool_permission (
                user_id INTEGER NOT NULL REFERENCES user (id) ON DELETE CASCADE,
                tool_name TEXT NOT NULL,
                can_read INTEGER NOT NULL,
                can_write INTEGER NOT NULL,
                can_execute INTEGER NOT NULL,
                enabled INTEGER NOT NULL,
                PRIMARY KEY (user_id, tool_name)
            );
            CREATE TABLE IF NOT EXISTS default_tool_permission (
                tool_name TEXT PRIMARY KEY,
                can_read INTEGER NOT NULL,
                can_write INTEGER NOT NULL,
                can_execute INTEGER NOT NULL,
                enabled INTEGER NOT NULL
            )",
        }]
    }
}

fn repo_err(e: anyhow::Error) -> BridgeError {
    BridgeError::Repository {
        msg: e.to_string(),
        source: Some(e),
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

const USER_COLUMNS: &str = "id, username, email, password_hash, is_admin, is_disabled, \
     must_rotate_password, failed_logins, locked_until, last_failed_at, created_at";

fn row_to_user(row: &libsql::Row) -> Result<User, BridgeError> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        is_admin: row.get::<i64>(4)? != 0,
        is_disabled: row.get::<i64>(5)? != 0,
        must_rotate_password: row.get::<i64>(6)? != 0,
        failed_logins: row.get(7)?,
        locked_until: opt_dt(row.get(8)?)?,
        last_failed_at: opt_dt(row.get(9)?)?,
        created_at: row.get(10)?,
    })
}

const SESSION_COLUMNS: &str = "id, user_id, access_token_jti, refresh_token_hash, issued_at, \
     expires_at, refresh_expires_at, user_agent, remote_addr, revoked";

fn row_to_session(row: &libsql::Row) -> Result<Session, BridgeError> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        access_token_jti: row.get(2)?,
        refresh_token_hash: row.get(3)?,
        issued_at: row.get(4)?,
        expires_at: row.get(5)?,
        refresh_expires_at: row.get(6)?,
        user_agent: row.get(7)?,
        remote_addr: row.get(8)?,
        revoked: row.get::<i64>(9)? != 0,
    })
}

const TOKEN_COLUMNS: &str = "id, user_id, name, token_hash, prefix, permissions_json, \
     created_at, expires_at, last_used_at, revoked";

fn row_to_api_token(row: &libsql::Row) -> Result<ApiToken, BridgeError> {
    let permissions_raw: Option<String> = row.get(5)?;
    Ok(ApiToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        token_hash: row.get(3)?,
        prefix: row.get(4)?,
        permissions_json: permissions_raw
            .map(|raw| serde_json::from_str(&raw).map(shared::primitives::WrappedJsonValue::new))
            .transpose()
            .map_err(|e| BridgeError::Repository {
                msg: "invalid permissions_json".to_string(),
                source: Some(anyhow::Error::from(e)),
            })?,
        created_at: row.get(6)?,
        expires_at: opt_dt(row.get(7)?)?,
        last_used_at: opt_dt(row.get(8)?)?,
        revoked: row.get::<i64>(9)? != 0,
    })
}

impl UserRepositoryLike for Repository {
    async fn create_user(&self, params: &NewUser) -> Result<User, BridgeError> {
        let created_at = WrappedChronoDateTime::now();
        self.conn
            .execute(
                "INSERT INTO user (username, email, password_hash, is_admin, must_rotate_password, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                libsql::params![
                    params.username.clone(),
                    params.email.clone(),
                    params.password_hash.clone(),
                    params.is_admin as i64,
                    params.must_rotate_password as i64,
                    created_at,
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE constraint failed") {
                    BridgeError::Conflict {
                        msg: "username or email already exists".to_string(),
                    }
                } else {
                    BridgeError::from(e)
                }
            })?;

        let user = self
            .get_user_by_username(&params.username)
            .await?
            .ok_or_else(|| BridgeError::internal("user vanished after insert"))?;
        Ok(user)
    }

    async fn get_user_by_id(&self, id: i64) -> Result<Option<User>, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                &format!("SELECT {USER_COLUMNS} FROM user WHERE id = ?"),
                [id],
            )
            .await
            .context("Failed to get user by id")
            .map_err(repo_err)?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                &format!("SELECT {USER_COLUMNS} FROM user WHERE username = ?"),
                [username],
            )
            .await
            .context("Failed to get user by username")
            .map_err(repo_err)?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>, BridgeError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {USER_COLUMNS} FROM user ORDER BY id ASC"),
                (),
            )
            .await?;

        let mut users = Vec::new();
        while let Some(row) = rows.next().await? {
            users.push(row_to_user(&row)?);
        }
        Ok(users)
    }

    async fn any_admin_exists(&self) -> Result<bool, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                "SELECT 1 FROM user WHERE is_admin = 1 AND is_disabled = 0 LIMIT 1",
                (),
            )
            .await?;
        Ok(row.is_some())
    }

    async fn update_password(
        &self,
        user_id: i64,
        password_hash: &str,
        must_rotate: bool,
    ) -> Result<(), BridgeError> {
        let changed = self
            .conn
            .execute(
                "UPDATE user SET password_hash = ?, must_rotate_password = ? WHERE id = ?",
                libsql::params![password_hash, must_rotate as i64, user_id],
            )
            .await?;
        if changed == 0 {
            return Err(BridgeError::NotFound {
                msg: "user not found".to_string(),
                lookup_id: user_id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_disabled(&self, user_id: i64, disabled: bool) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "UPDATE user SET is_disabled = ? WHERE id = ?",
                libsql::params![disabled as i64, user_id],
            )
            .await?;
        Ok(())
    }

    async fn record_login_failure(
        &self,
        user_id: i64,
        failed_logins: i64,
        locked_until: Option<WrappedChronoDateTime>,
        last_failed_at: WrappedChronoDateTime,
    ) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "UPDATE user SET failed_logins = ?, locked_until = ?, last_failed_at = ? WHERE id = ?",
                libsql::params![
                    failed_logins,
                    locked_until.map(libsql::Value::from),
                    last_failed_at,
                    user_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn record_login_success(&self, user_id: i64) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "UPDATE user SET failed_logins = 0, locked_until = NULL, last_failed_at = NULL
                 WHERE id = ?",
                libsql::params![user_id],
            )
            .await?;
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "INSERT INTO session
                     (id, user_id, access_token_jti, refresh_token_hash, issued_at, expires_at,
                      refresh_expires_at, user_agent, remote_addr, revoked)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    session.id.clone(),
                    session.user_id,
                    session.access_token_jti.clone(),
                    session.refresh_token_hash.clone(),
                    session.issued_at,
                    session.expires_at,
                    session.refresh_expires_at,
                    session.user_agent.clone(),
                    session.remote_addr.clone(),
                    session.revoked as i64,
                ],
            )
            .await
            .context("Failed to insert session")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn get_session_by_jti(&self, jti: &str) -> Result<Option<Session>, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                &format!("SELECT {SESSION_COLUMNS} FROM session WHERE access_token_jti = ?"),
                [jti],
            )
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn get_session_by_refresh_hash(
        &self,
        refresh_token_hash: &str,
    ) -> Result<Option<Session>, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                &format!("SELECT {SESSION_COLUMNS} FROM session WHERE refresh_token_hash = ?"),
                [refresh_token_hash],
            )
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn rotate_session(
        &self,
        session_id: &str,
        rotation: &SessionRotation,
    ) -> Result<(), BridgeError> {
        let changed = self
            .conn
            .execute(
                "UPDATE session
                 SET access_token_jti = ?, refresh_token_hash = ?, issued_at = ?, expires_at = ?
                 WHERE id = ? AND revoked = 0",
                libsql::params![
                    rotation.access_token_jti.clone(),
                    rotation.refresh_token_hash.clone(),
                    rotation.issued_at,
                    rotation.expires_at,
                    session_id,
                ],
            )
            .await?;
        if changed == 0 {
            return Err(BridgeError::TokenRevoked);
        }
        Ok(())
    }

    async fn revoke_session(&self, session_id: &str) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "UPDATE session SET revoked = 1 WHERE id = ?",
                libsql::params![session_id],
            )
            .await?;
        Ok(())
    }

    async fn revoke_sessions_for_user(&self, user_id: i64) -> Result<u64, BridgeError> {
        let changed = self
            .conn
            .execute(
                "UPDATE session SET revoked = 1 WHERE user_id = ? AND revoked = 0",
                libsql::params![user_id],
            )
            .await?;
        Ok(changed)
    }

    async fn list_sessions_for_user(&self, user_id: i64) -> Result<Vec<Session>, BridgeError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM session WHERE user_id = ?
                     ORDER BY issued_at DESC"
                ),
                [user_id],
            )
            .await?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await? {
            sessions.push(row_to_session(&row)?);
        }
        Ok(sessions)
    }

    async fn sweep_expired_sessions(
        &self,
        now: WrappedChronoDateTime,
    ) -> Result<u64, BridgeError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM session WHERE refresh_expires_at < ?",
                libsql::params![now],
            )
            .await?;
        Ok(deleted)
    }

    async fn create_api_token(&self, token: &ApiToken) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "INSERT INTO api_token
                     (id, user_id, name, token_hash, prefix, permissions_json, created_at,
                      expires_at, last_used_at, revoked)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    token.id.clone(),
                    token.user_id,
                    token.name.clone(),
                    token.token_hash.clone(),
                    token.prefix.clone(),
                    token.permissions_json.clone().map(libsql::Value::from),
                    token.created_at,
                    token.expires_at.map(libsql::Value::from),
                    token.last_used_at.map(libsql::Value::from),
                    token.revoked as i64,
                ],
            )
            .await
            .context("Failed to create api token")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn get_api_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<ApiToken>, BridgeError> {
        let row = self
            .conn
            .query_row_opt(
                &format!("SELECT {TOKEN_COLUMNS} FROM api_token WHERE token_hash = ?"),
                [token_hash],
            )
            .await?;
        row.as_ref().map(row_to_api_token).transpose()
    }

    async fn list_api_tokens_for_user(&self, user_id: i64) -> Result<Vec<ApiToken>, BridgeError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM api_token WHERE user_id = ?
                     ORDER BY created_at DESC"
                ),
                [user_id],
            )
            .await?;

        let mut tokens = Vec::new();
        while let Some(row) = rows.next().await? {
            tokens.push(row_to_api_token(&row)?);
        }
        Ok(tokens)
    }

    async fn touch_api_token(
        &self,
        token_id: &str,
        at: WrappedChronoDateTime,
    ) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "UPDATE api_token SET last_used_at = ? WHERE id = ?",
                libsql::params![at, token_id],
            )
            .await?;
        Ok(())
    }

    async fn revoke_api_token(&self, token_id: &str) -> Result<(), BridgeError> {
        let changed = self
            .conn
            .execute(
                "UPDATE api_token SET revoked = 1 WHERE id = ?",
                libsql::params![token_id],
            )
            .await?;
        if changed == 0 {
            return Err(BridgeError::NotFound {
                msg: "api token not found".to_string(),
                lookup_id: token_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_effective_permission(
        &self,
        user_id: i64,
        tool_name: &str,
    ) -> Result<EffectivePermission, BridgeError> {
        // User override first, default second; one round-trip.
        let row = self
            .conn
            .query_row_opt(
                "SELECT can_read, can_write, can_execute, enabled, 0 AS rank
                   FROM tool_permission WHERE user_id = ? AND tool_name = ?
                 UNION ALL
                 SELECT can_read, can_write, can_execute, enabled, 1 AS rank
                   FROM default_tool_permission WHERE tool_name = ?
                 ORDER BY rank LIMIT 1",
                libsql::params![user_id, tool_name, tool_name],
            )
            .await?;

        match row {
            Some(row) => Ok(EffectivePermission {
                bits: PermissionBits {
                    can_read: row.get::<i64>(0)? != 0,
                    can_write: row.get::<i64>(1)? != 0,
                    can_execute: row.get::<i64>(2)? != 0,
                    enabled: row.get::<i64>(3)? != 0,
                },
                source: if row.get::<i64>(4)? == 0 {
                    PermissionSource::UserOverride
                } else {
                    PermissionSource::Default
                },
            }),
            None => Ok(EffectivePermission {
                bits: PermissionBits::denied(),
                source: PermissionSource::Unknown,
            }),
        }
    }

    async fn set_tool_permission(&self, permission: &ToolPermission) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "INSERT INTO tool_permission (user_id, tool_name, can_read, can_write, can_execute, enabled)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (user_id, tool_name) DO UPDATE SET
                     can_read = excluded.can_read,
                     can_write = excluded.can_write,
                     can_execute = excluded.can_execute,
                     enabled = excluded.enabled",
                libsql::params![
                    permission.user_id,
                    permission.tool_name.clone(),
                    permission.bits.can_read as i64,
                    permission.bits.can_write as i64,
                    permission.bits.can_execute as i64,
                    permission.bits.enabled as i64,
                ],
            )
            .await?;
        Ok(())
    }

    async fn clear_tool_permission(
        &self,
        user_id: i64,
        tool_name: &str,
    ) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "DELETE FROM tool_permission WHERE user_id = ? AND tool_name = ?",
                libsql::params![user_id, tool_name],
            )
            .await?;
        Ok(())
    }

    async fn list_tool_permissions(
        &self,
        user_id: i64,
    ) -> Result<Vec<ToolPermission>, BridgeError> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_id, tool_name, can_read, can_write, can_execute, enabled
                 FROM tool_permission WHERE user_id = ? ORDER BY tool_name ASC",
                [user_id],
            )
            .await?;

        let mut permissions = Vec::new();
        while let Some(row) = rows.next().await? {
            permissions.push(ToolPermission {
                user_id: row.get(0)?,
                tool_name: row.get(1)?,
                bits: PermissionBits {
                    can_read: row.get::<i64>(2)? != 0,
                    can_write: row.get::<i64>(3)? != 0,
                    can_execute: row.get::<i64>(4)? != 0,
                    enabled: row.get::<i64>(5)? != 0,
                },
            });
        }
        Ok(permissions)
    }

    async fn set_default_permission(
        &self,
        tool_name: &str,
        bits: PermissionBits,
    ) -> Result<(), BridgeError> {
        self.conn
            .execute(
                "INSERT INTO default_tool_permission (tool_name, can_read, can_write, can_execute, enabled)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (tool_name) DO UPDATE SET
                     can_read = excluded.can_read,
                     can_write = excluded.can_write,
                     can_execute = excluded.can_execute,
                     enabled = excluded.enabled",
                libsql::params![
                    tool_name,
                    bits.can_read as i64,
                    bits.can_write as i64,
                    bits.can_execute as i64,
                    bits.enabled as i64,
                ],
            )
            .await?;
        Ok(())
    }

    async fn seed_default_permissions(
        &self,
        defaults: &[(String, PermissionBits)],
    ) -> Result<(), BridgeError> {
        let tx = self.conn.transaction().await?;
        for (tool_name, bits) in defaults {
            tx.execute(
                "INSERT INTO default_tool_permission (tool_name, can_read, can_write, can_execute, enabled)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (tool_name) DO NOTHING",
                libsql::params![
                    tool_name.clone(),
                    bits.can_read as i64,
                    bits.can_write as i64,
                    bits.can_execute as i64,
                    bits.enabled as i64,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test;
