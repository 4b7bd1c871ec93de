use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use utoipa::ToSchema;

use crate::repository::SystemKey;

/// Hard ceiling on access-token lifetime.
pub const MAX_ACCESS_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub is_admin: bool,
}

/// HMAC signer/verifier bound to the active `jwt_signing` system key.
#[derive(Clone)]
pub struct JwtSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    ttl_secs: u64,
}

impl JwtSigner {
    pub fn from_system_key(
        key: &SystemKey,
        issuer: impl Into<String>,
        ttl_secs: u64,
    ) -> Result<Self, BridgeError> {
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&key.secret)
            .map_err(|e| BridgeError::Crypto {
                source: Some(anyhow::anyhow!("invalid jwt key material: {e}")),
            })?;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(&secret),
            decoding_key: DecodingKey::from_secret(&secret),
            issuer: issuer.into(),
            ttl_secs: ttl_secs.min(MAX_ACCESS_TTL_SECS),
        })
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Issue an access token for a user. The `jti` ties the token to its
    /// session row so revocation is enforceable.
    pub fn issue(
        &self,
        sub: &str,
        jti: &str,
        is_admin: bool,
    ) -> Result<(String, AccessTokenClaims), BridgeError> {
        self.issue_with_ttl(sub, jti, is_admin, self.ttl_secs)
    }

    /// Issue with an explicit lifetime, still capped by the signer's TTL.
    /// Used on refresh, where the access token must not outlive the
    /// session's refresh horizon.
    pub fn issue_with_ttl(
        &self,
        sub: &str,
        jti: &str,
        is_admin: bool,
        ttl_secs: u64,
    ) -> Result<(String, AccessTokenClaims), BridgeError> {
        let ttl_secs = ttl_secs.min(self.ttl_secs);
        let now = chrono::Utc::now();
        let claims = AccessTokenClaims {
            sub: sub.to_string(),
            jti: jti.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + ttl_secs as i64,
            iss: self.issuer.clone(),
            is_admin,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| BridgeError::Crypto {
                source: Some(anyhow::anyhow!("jwt signing failed: {e}")),
            })?;

        Ok((token, claims))
    }

    /// Validate signature, expiry and issuer. Expired tokens report
    /// `TokenExpired`; every other failure is a generic `Unauthorized`.
    pub fn verify(&self, token: &str) -> Result<AccessTokenClaims, BridgeError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);

        match decode::<AccessTokenClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
                Err(BridgeError::TokenExpired)
            }
            Err(e) => Err(BridgeError::Unauthorized {
                msg: "invalid token".to_string(),
                source: Some(anyhow::Error::from(e)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::keys::{KeyPurpose, generate_system_key};

    fn signer(ttl_secs: u64) -> JwtSigner {
        let key = generate_system_key(KeyPurpose::JwtSigning);
        JwtSigner::from_system_key(&key, "hearth-test", ttl_secs).unwrap()
    }

    #[test]
    fn issue_and_verify_carries_claims() {
        let signer = signer(3600);
        let (token, issued) = signer.issue("7", "jti-1", true).unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.jti, "jti-1");
        assert!(claims.is_admin);
        assert_eq!(claims.exp, issued.exp);
    }

    #[test]
    fn ttl_is_clamped_to_24h() {
        let signer = signer(7 * 24 * 60 * 60);
        assert_eq!(signer.ttl_secs(), MAX_ACCESS_TTL_SECS);
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let ours = signer(3600);
        let theirs = signer(3600);
        let (token, _) = theirs.issue("7", "jti-1", false).unwrap();
        match ours.verify(&token) {
            Err(BridgeError::Unauthorized { .. }) => {}
            other => panic!("expected Unauthorized, got {other:?}"),
        }
    }

    #[test]
    fn expired_token_is_token_expired() {
        let key = generate_system_key(KeyPurpose::JwtSigning);
        let signer = JwtSigner::from_system_key(&key, "hearth-test", 3600).unwrap();

        // Forge an already-expired token with the same key
        let now = chrono::Utc::now().timestamp();
        let claims = AccessTokenClaims {
            sub: "7".into(),
            jti: "jti-1".into(),
            iat: now - 7200,
            exp: now - 3600,
            iss: "hearth-test".into(),
            is_admin: false,
        };
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&key.secret)
            .unwrap();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&secret),
        )
        .unwrap();

        match signer.verify(&token) {
            Err(BridgeError::TokenExpired) => {}
            other => panic!("expected TokenExpired, got {other:?}"),
        }
    }
}
