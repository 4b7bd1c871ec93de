pub mod sqlite;

pub use sqlite::Repository;

use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use shared::primitives::WrappedChronoDateTime;
use utoipa::ToSchema;

use crate::logic::keys::KeyPurpose;

/// Key material record. `secret` is base64 of 32 random bytes; the actual
/// working key for encryption purposes is derived with a KDF over
/// `kdf_salt` and never stored.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SystemKey {
    pub key_id: String,
    pub purpose: KeyPurpose,
    #[serde(skip_serializing)]
    pub secret: String,
    #[serde(skip_serializing)]
    pub kdf_salt: Option<String>,
    pub active: bool,
    pub created_at: WrappedChronoDateTime,
    pub rotated_at: Option<WrappedChronoDateTime>,
}

#[allow(async_fn_in_trait)]
pub trait SystemKeyRepositoryLike {
    async fn get_active_key(&self, purpose: KeyPurpose)
    -> Result<Option<SystemKey>, BridgeError>;

    async fn insert_key(&self, key: &SystemKey) -> Result<(), BridgeError>;

    /// Insert the new key as active and deactivate the previous one, in a
    /// single transaction.
    async fn replace_active_key(
        &self,
        purpose: KeyPurpose,
        old_key_id: Option<&str>,
        new: &SystemKey,
    ) -> Result<(), BridgeError>;

    async fn list_keys(&self) -> Result<Vec<SystemKey>, BridgeError>;
}
