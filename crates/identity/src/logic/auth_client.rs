use encryption::logic::jwt::JwtSigner;
use encryption::logic::token::{hash_token, looks_like_api_token};
use http::HeaderMap;
use serde::Serialize;
use shared::error::BridgeError;
use shared::primitives::WrappedChronoDateTime;
use utoipa::ToSchema;

use crate::logic::lockout;
use crate::repository::{ApiToken, User, UserRepositoryLike};

/// Only bump `last_used_at` when the previous touch is older than this,
/// to keep hot tokens from writing on every request.
const TOUCH_INTERVAL_SECS: i64 = 60;

/// Resolved caller identity: exactly one user, reached through either a
/// JWT session or an opaque API token.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub is_admin: bool,
    /// Set when authenticated via JWT
    pub session_id: Option<String>,
    /// Set when authenticated via API token
    #[serde(skip)]
    pub api_token: Option<ApiToken>,
}

impl Identity {
    pub fn auth_kind(&self) -> &'static str {
        if self.api_token.is_some() {
            "api_token"
        } else {
            "jwt"
        }
    }
}

/// Validates bearer credentials against the store. Cloned freely; all the
/// state lives in the repository and the signer.
#[derive(Clone)]
pub struct AuthClient<R: UserRepositoryLike> {
    repository: R,
    jwt_signer: JwtSigner,
}

impl<R: UserRepositoryLike> AuthClient<R> {
    pub fn new(repository: R, jwt_signer: JwtSigner) -> Self {
        Self {
            repository,
            jwt_signer,
        }
    }

    pub fn jwt_signer(&self) -> &JwtSigner {
        &self.jwt_signer
    }

    /// Resolve the caller from HTTP headers. Requires
    /// `Authorization: Bearer <jwt-or-api-token>`.
    pub async fn authenticate_from_headers(
        &self,
        headers: &HeaderMap,
    ) -> Result<Identity, BridgeError> {
        let bearer = extract_bearer(headers).ok_or_else(|| BridgeError::Unauthorized {
            msg: "missing bearer credential".to_string(),
            source: None,
        })?;
        self.authenticate_bearer(&bearer).await
    }

    /// An opaque token is recognized by its `hb_` prefix; everything else
    /// is treated as a JWT.
    pub async fn authenticate_bearer(&self, bearer: &str) -> Result<Identity, BridgeError> {
        if looks_like_api_token(bearer) {
            self.authenticate_api_token(bearer).await
        } else {
            self.authenticate_jwt(bearer).await
        }
    }

    async fn authenticate_api_token(&self, bearer: &str) -> Result<Identity, BridgeError> {
        let token = self
            .repository
            .get_api_token_by_hash(&hash_token(bearer))
            .await?
            .ok_or_else(|| BridgeError::Unauthorized {
                msg: "invalid token".to_string(),
                source: None,
            })?;

        if token.revoked {
            return Err(BridgeError::TokenRevoked);
        }
        if let Some(expires_at) = &token.expires_at {
            if *expires_at.get_inner() <= chrono::Utc::now() {
                return Err(BridgeError::TokenExpired);
            }
        }

        let user = self.load_checked_user(token.user_id).await?;

        let needs_touch = token
            .last_used_at
            .map(|at| {
                (chrono::Utc::now() - *at.get_inner()).num_seconds() >= TOUCH_INTERVAL_SECS
            })
            .unwrap_or(true);
        if needs_touch {
            self.repository
                .touch_api_token(&token.id, WrappedChronoDateTime::now())
                .await?;
        }

        Ok(Identity {
            user_id: user.id,
            username: user.username,
            is_admin: user.is_admin,
            session_id: None,
            api_token: Some(token),
        })
    }

    async fn authenticate_jwt(&self, bearer: &str) -> Result<Identity, BridgeError> {
        let claims = self.jwt_signer.verify(bearer)?;

        let session = self
            .repository
            .get_session_by_jti(&claims.jti)
            .await?
            .ok_or_else(|| BridgeError::Unauthorized {
                msg: "invalid token".to_string(),
                source: None,
            })?;
        if session.revoked {
            return Err(BridgeError::TokenRevoked);
        }

        let user = self.load_checked_user(session.user_id).await?;

        Ok(Identity {
            user_id: user.id,
            username: user.username,
            is_admin: user.is_admin,
            session_id: Some(session.id),
            api_token: None,
        })
    }

    async fn load_checked_user(&self, user_id: i64) -> Result<User, BridgeError> {
        let user = self
            .repository
            .get_user_by_id(user_id)
            .await?
            .ok_or_else(|| BridgeError::Unauthorized {
                msg: "invalid token".to_string(),
                source: None,
            })?;

        if user.is_disabled {
            return Err(BridgeError::Unauthorized {
                msg: "invalid token".to_string(),
                source: None,
            });
        }
        if let Some(retry_after_ms) = lockout::lock_remaining_ms(&user, chrono::Utc::now()) {
            return Err(BridgeError::AccountLocked { retry_after_ms });
        }

        Ok(user)
    }
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth_header = headers.get(http::header::AUTHORIZATION)?;
    let auth_str = auth_header.to_str().ok()?.trim();

    if let Some(token) = auth_str.strip_prefix("Bearer ") {
        Some(token.trim().to_string())
    } else if let Some(token) = auth_str.strip_prefix("bearer ") {
        Some(token.trim().to_string())
    } else {
        None
    }
}

pub fn require_admin(identity: &Identity) -> Result<(), BridgeError> {
    if identity.is_admin {
        Ok(())
    } else {
        Err(BridgeError::Forbidden {
            msg: "administrator access required".to_string(),
        })
    }
}
