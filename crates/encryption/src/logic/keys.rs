use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use shared::primitives::WrappedChronoDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::repository::{SystemKey, SystemKeyRepositoryLike};

/// What a system key is used for. Exactly one key per purpose is active at
/// any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    HubTokenEncryption,
    JwtSigning,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 2] = [KeyPurpose::HubTokenEncryption, KeyPurpose::JwtSigning];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::HubTokenEncryption => "hub_token_encryption",
            KeyPurpose::JwtSigning => "jwt_signing",
        }
    }
}

impl std::str::FromStr for KeyPurpose {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hub_token_encryption" => Ok(KeyPurpose::HubTokenEncryption),
            "jwt_signing" => Ok(KeyPurpose::JwtSigning),
            other => Err(BridgeError::InvalidArgument {
                msg: format!("unknown key purpose: {other}"),
            }),
        }
    }
}

impl std::fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a fresh system key: 32 random bytes of key material plus, for
/// encryption keys, a 16-byte per-install KDF salt.
pub fn generate_system_key(purpose: KeyPurpose) -> SystemKey {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);

    let kdf_salt = match purpose {
        KeyPurpose::HubTokenEncryption => {
            let mut salt = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut salt);
            Some(base64::engine::general_purpose::STANDARD.encode(salt))
        }
        KeyPurpose::JwtSigning => None,
    };

    SystemKey {
        key_id: format!("{}_{}", purpose.as_str(), uuid::Uuid::new_v4()),
        purpose,
        secret: base64::engine::general_purpose::STANDARD.encode(secret),
        kdf_salt,
        active: true,
        created_at: WrappedChronoDateTime::now(),
        rotated_at: None,
    }
}

/// Ensure an active key exists for every purpose, generating missing ones.
/// Called at bootstrap before any request is served.
pub async fn ensure_system_keys<R: SystemKeyRepositoryLike>(
    repository: &R,
) -> Result<(), BridgeError> {
    for purpose in KeyPurpose::ALL {
        if repository.get_active_key(purpose).await?.is_none() {
            let key = generate_system_key(purpose);
            info!(purpose = %purpose, key_id = %key.key_id, "generating system key");
            repository.insert_key(&key).await?;
        }
    }
    Ok(())
}

/// Activate a fresh key for the purpose and deactivate the old one in a
/// single transaction. Returns (old, new); the caller re-encrypts any
/// dependent ciphertexts under the new key.
pub async fn rotate_system_key<R: SystemKeyRepositoryLike>(
    repository: &R,
    purpose: KeyPurpose,
) -> Result<(Option<SystemKey>, SystemKey), BridgeError> {
    let old = repository.get_active_key(purpose).await?;
    let new = generate_system_key(purpose);
    repository
        .replace_active_key(purpose, old.as_ref().map(|k| k.key_id.as_str()), &new)
        .await?;
    info!(purpose = %purpose, key_id = %new.key_id, "rotated system key");
    Ok((old, new))
}
