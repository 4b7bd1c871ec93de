use base64::Engine;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use utoipa::ToSchema;
use zeroize::Zeroizing;

use crate::repository::SystemKey;

/// Number of PBKDF2 rounds used to stretch a system key into an AES key.
pub const KDF_ITERATIONS: u32 = 210_000;

/// A base64 blob of `nonce || ciphertext || tag`. Debug output is redacted
/// so encrypted credentials cannot leak through log formatting.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(transparent)]
pub struct EncryptedString(pub String);

impl std::fmt::Debug for EncryptedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedString(************)")
    }
}

impl libsql::FromValue for EncryptedString {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => Ok(EncryptedString(s)),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

impl From<EncryptedString> for libsql::Value {
    fn from(value: EncryptedString) -> Self {
        libsql::Value::Text(value.0)
    }
}

/// Symmetric encryption bound to one system key. The AES key is derived
/// once from the key's secret and per-install salt, and scrubbed on drop.
#[derive(Clone)]
pub struct CryptoService {
    key_id: String,
    key_bytes: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for CryptoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoService")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl CryptoService {
    pub fn from_system_key(key: &SystemKey) -> Result<Self, BridgeError> {
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&key.secret)
            .map_err(|e| BridgeError::Crypto {
                source: Some(anyhow::anyhow!("invalid key material encoding: {e}")),
            })?;
        let salt_b64 = key.kdf_salt.as_ref().ok_or_else(|| BridgeError::Crypto {
            source: Some(anyhow::anyhow!(
                "system key {} has no kdf salt",
                key.key_id
            )),
        })?;
        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt_b64)
            .map_err(|e| BridgeError::Crypto {
                source: Some(anyhow::anyhow!("invalid salt encoding: {e}")),
            })?;

        let mut key_bytes = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(&secret, &salt, KDF_ITERATIONS, &mut *key_bytes);

        Ok(Self {
            key_id: key.key_id.clone(),
            key_bytes,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedString, BridgeError> {
        use aes_gcm::{
            Aes256Gcm, Nonce,
            aead::{Aead, KeyInit, OsRng},
        };
        use rand::RngCore;

        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(&*self.key_bytes);
        let cipher = Aes256Gcm::new(key);

        // Random 96-bit nonce per ciphertext
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| BridgeError::Crypto {
                source: Some(anyhow::anyhow!("encryption failed: {e}")),
            })?;

        // [nonce (12 bytes) | ciphertext+tag]
        let mut result = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &result);
        Ok(EncryptedString(encoded))
    }

    /// Decrypt into a buffer that is zeroed when dropped. A tag mismatch is
    /// an integrity failure: the credential is unusable, never replaced.
    pub fn decrypt(&self, data: &EncryptedString) -> Result<Zeroizing<String>, BridgeError> {
        use aes_gcm::{
            Aes256Gcm, Nonce,
            aead::{Aead, KeyInit},
        };

        let encrypted_data =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &data.0)
                .map_err(|_e| BridgeError::Integrity)?;

        if encrypted_data.len() < 12 {
            return Err(BridgeError::Integrity);
        }

        let nonce = Nonce::from_slice(&encrypted_data[..12]);
        let ciphertext = &encrypted_data[12..];

        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(&*self.key_bytes);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_e| BridgeError::Integrity)?;

        let result = Zeroizing::new(String::from_utf8(plaintext).map_err(|e| {
            BridgeError::Crypto {
                source: Some(anyhow::anyhow!("invalid utf-8 in decrypted data: {e}")),
            }
        })?);

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::keys::generate_system_key;
    use crate::logic::keys::KeyPurpose;

    fn service() -> CryptoService {
        let key = generate_system_key(KeyPurpose::HubTokenEncryption);
        CryptoService::from_system_key(&key).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let svc = service();
        let cipher = svc.encrypt("long-lived-hub-token").unwrap();
        assert_ne!(cipher.0, "long-lived-hub-token");
        let plain = svc.decrypt(&cipher).unwrap();
        assert_eq!(&*plain, "long-lived-hub-token");
    }

    #[test]
    fn nonces_are_fresh_per_ciphertext() {
        let svc = service();
        let a = svc.encrypt("same input").unwrap();
        let b = svc.encrypt("same input").unwrap();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn tampered_ciphertext_is_an_integrity_error() {
        let svc = service();
        let cipher = svc.encrypt("secret").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&cipher.0)
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered =
            EncryptedString(base64::engine::general_purpose::STANDARD.encode(&raw));

        match svc.decrypt(&tampered) {
            Err(BridgeError::Integrity) => {}
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[test]
    fn wrong_key_cannot_decrypt() {
        let cipher = service().encrypt("secret").unwrap();
        let other = service();
        assert!(other.decrypt(&cipher).is_err());
    }

    #[test]
    fn debug_output_is_redacted() {
        let cipher = service().encrypt("topsecret").unwrap();
        let debug = format!("{cipher:?}");
        assert!(!debug.contains(&cipher.0));
    }
}
