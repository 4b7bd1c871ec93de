pub mod sqlite;

pub use sqlite::Repository;

use encryption::logic::EncryptedString;
use serde::Serialize;
use shared::error::BridgeError;
use shared::primitives::WrappedChronoDateTime;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HubConfig {
    pub id: String,
    pub user_id: i64,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub token_cipher: EncryptedString,
    pub last_probe_at: Option<WrappedChronoDateTime>,
    pub last_probe_status: Option<String>,
    pub last_probe_latency_ms: Option<i64>,
    pub last_probe_version: Option<String>,
    pub last_probe_entities: Option<i64>,
    pub is_default: bool,
    pub created_at: WrappedChronoDateTime,
}

#[derive(Debug, Clone)]
pub struct ProbeRecord {
    pub at: WrappedChronoDateTime,
    pub status: String,
    pub latency_ms: Option<i64>,
    pub version: Option<String>,
    pub entities: Option<i64>,
}

#[allow(async_fn_in_trait)]
pub trait HubConfigRepositoryLike: Clone + Send + Sync + 'static {
    async fn insert_config(&self, config: &HubConfig) -> Result<(), BridgeError>;

    async fn update_config(
        &self,
        id: &str,
        user_id: i64,
        name: &str,
        url: &str,
        token_cipher: Option<&EncryptedString>,
    ) -> Result<(), BridgeError>;

    async fn delete_config(&self, id: &str, user_id: i64) -> Result<(), BridgeError>;

    async fn get_config(&self, id: &str, user_id: i64)
    -> Result<Option<HubConfig>, BridgeError>;

    async fn list_configs_for_user(&self, user_id: i64) -> Result<Vec<HubConfig>, BridgeError>;

    /// Every config in the store, regardless of owner. Used by key rotation
    /// to re-encrypt all stored tokens.
    async fn list_all_configs(&self) -> Result<Vec<HubConfig>, BridgeError>;

    /// Make `id` the user's default, clearing any other default in the same
    /// transaction. Idempotent.
    async fn set_default_config(&self, user_id: i64, id: &str) -> Result<(), BridgeError>;

    async fn get_default_config(&self, user_id: i64)
    -> Result<Option<HubConfig>, BridgeError>;

    async fn record_probe(&self, id: &str, probe: &ProbeRecord) -> Result<(), BridgeError>;

    async fn update_token_cipher(
        &self,
        id: &str,
        token_cipher: &EncryptedString,
    ) -> Result<(), BridgeError>;
}
