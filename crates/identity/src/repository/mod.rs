pub mod sqlite;

pub use sqlite::Repository;

use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use shared::primitives::{WrappedChronoDateTime, WrappedJsonValue};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub is_disabled: bool,
    pub must_rotate_password: bool,
    pub failed_logins: i64,
    pub locked_until: Option<WrappedChronoDateTime>,
    pub last_failed_at: Option<WrappedChronoDateTime>,
    pub created_at: WrappedChronoDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub must_rotate_password: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub id: String,
    pub user_id: i64,
    pub access_token_jti: String,
    #[serde(skip_serializing)]
    pub refresh_token_hash: String,
    pub issued_at: WrappedChronoDateTime,
    pub expires_at: WrappedChronoDateTime,
    pub refresh_expires_at: WrappedChronoDateTime,
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
    pub revoked: bool,
}

/// Rotation payload applied on refresh: new access jti, new refresh hash,
/// new expiry. The session id and the refresh horizon stay fixed.
#[derive(Debug, Clone)]
pub struct SessionRotation {
    pub access_token_jti: String,
    pub refresh_token_hash: String,
    pub issued_at: WrappedChronoDateTime,
    pub expires_at: WrappedChronoDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiToken {
    pub id: String,
    pub user_id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub prefix: String,
    pub permissions_json: Option<WrappedJsonValue>,
    pub created_at: WrappedChronoDateTime,
    pub expires_at: Option<WrappedChronoDateTime>,
    pub last_used_at: Option<WrappedChronoDateTime>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PermissionBits {
    pub can_read: bool,
    pub can_write: bool,
    pub can_execute: bool,
    pub enabled: bool,
}

impl PermissionBits {
    pub const fn all() -> Self {
        Self {
            can_read: true,
            can_write: true,
            can_execute: true,
            enabled: true,
        }
    }

    pub const fn read_only() -> Self {
        Self {
            can_read: true,
            can_write: false,
            can_execute: false,
            enabled: true,
        }
    }

    pub const fn denied() -> Self {
        Self {
            can_read: false,
            can_write: false,
            can_execute: false,
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ToolPermission {
    pub user_id: i64,
    pub tool_name: String,
    #[serde(flatten)]
    pub bits: PermissionBits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PermissionSource {
    UserOverride,
    Default,
    Unknown,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EffectivePermission {
    #[serde(flatten)]
    pub bits: PermissionBits,
    pub source: PermissionSource,
}

#[allow(async_fn_in_trait)]
pub trait UserRepositoryLike: Clone + Send + Sync + 'static {
    // User methods
    async fn create_user(&self, params: &NewUser) -> Result<User, BridgeError>;

    async fn get_user_by_id(&self, id: i64) -> Result<Option<User>, BridgeError>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, BridgeError>;

    async fn list_users(&self) -> Result<Vec<User>, BridgeError>;

    async fn any_admin_exists(&self) -> Result<bool, BridgeError>;

    async fn update_password(
        &self,
        user_id: i64,
        password_hash: &str,
        must_rotate: bool,
    ) -> Result<(), BridgeError>;

    async fn set_disabled(&self, user_id: i64, disabled: bool) -> Result<(), BridgeError>;

    /// Record a failed login: bump the counter and set `locked_until` when
    /// the policy says so. The whole update is one statement.
    async fn record_login_failure(
        &self,
        user_id: i64,
        failed_logins: i64,
        locked_until: Option<WrappedChronoDateTime>,
        last_failed_at: WrappedChronoDateTime,
    ) -> Result<(), BridgeError>;

    async fn record_login_success(&self, user_id: i64) -> Result<(), BridgeError>;

    // Session methods
    async fn insert_session(&self, session: &Session) -> Result<(), BridgeError>;

    async fn get_session_by_jti(&self, jti: &str) -> Result<Option<Session>, BridgeError>;

    async fn get_session_by_refresh_hash(
        &self,
        refresh_token_hash: &str,
    ) -> Result<Option<Session>, BridgeError>;

    async fn rotate_session(
        &self,
        session_id: &str,
        rotation: &SessionRotation,
    ) -> Result<(), BridgeError>;

    async fn revoke_session(&self, session_id: &str) -> Result<(), BridgeError>;

    async fn revoke_sessions_for_user(&self, user_id: i64) -> Result<u64, BridgeError>;

    async fn list_sessions_for_user(&self, user_id: i64) -> Result<Vec<Session>, BridgeError>;

    /// Delete sessions whose refresh horizon has passed.
    async fn sweep_expired_sessions(
        &self,
        now: WrappedChronoDateTime,
    ) -> Result<u64, BridgeError>;

    // API token methods
    async fn create_api_token(&self, token: &ApiToken) -> Result<(), BridgeError>;

    async fn get_api_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<ApiToken>, BridgeError>;

    async fn list_api_tokens_for_user(&self, user_id: i64) -> Result<Vec<ApiToken>, BridgeError>;

    async fn touch_api_token(
        &self,
        token_id: &str,
        at: WrappedChronoDateTime,
    ) -> Result<(), BridgeError>;

    async fn revoke_api_token(&self, token_id: &str) -> Result<(), BridgeError>;

    // Tool permission methods
    async fn get_effective_permission(
        &self,
        user_id: i64,
        tool_name: &str,
    ) -> Result<EffectivePermission, BridgeError>;

    async fn set_tool_permission(&self, permission: &ToolPermission) -> Result<(), BridgeError>;

    async fn clear_tool_permission(
        &self,
        user_id: i64,
        tool_name: &str,
    ) -> Result<(), BridgeError>;

    async fn list_tool_permissions(&self, user_id: i64)
    -> Result<Vec<ToolPermission>, BridgeError>;

    async fn set_default_permission(
        &self,
        tool_name: &str,
        bits: PermissionBits,
    ) -> Result<(), BridgeError>;

    /// Insert defaults for tools that have none yet; existing rows win.
    async fn seed_default_permissions(
        &self,
        defaults: &[(String, PermissionBits)],
    ) -> Result<(), BridgeError>;
}
