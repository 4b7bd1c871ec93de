use encryption::logic::jwt::JwtSigner;
use encryption::logic::password::{hash_password, verify_password};
use encryption::logic::token::{generate_refresh_token, hash_token};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use shared::primitives::WrappedChronoDateTime;
use telemetry::{LogCategory, LogStore};
use telemetry::repository::TelemetryRepositoryLike;
use utoipa::ToSchema;

use crate::logic::lockout;
use crate::repository::{Session, SessionRotation, User, UserRepositoryLike};

/// Hash verified against when the username does not exist, so the handler
/// takes the same time either way.
static DUMMY_HASH: Lazy<String> = Lazy::new(|| hash_password("not-a-real-password"));

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginParams {
    pub username: String,
    pub password: String,
    #[serde(skip)]
    pub user_agent: Option<String>,
    #[serde(skip)]
    pub remote_addr: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResult {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
    pub must_rotate_password: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshParams {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RefreshResult {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

fn uniform_unauthorized() -> BridgeError {
    // Never distinguish unknown user from bad password
    BridgeError::Unauthorized {
        msg: "invalid credentials".to_string(),
        source: None,
    }
}

/// Authenticate a username/password pair and mint a session.
pub async fn login<R, T>(
    repository: &R,
    logstore: &LogStore<T>,
    signer: &JwtSigner,
    refresh_ttl_secs: u64,
    params: LoginParams,
) -> Result<LoginResult, BridgeError>
where
    R: UserRepositoryLike,
    T: TelemetryRepositoryLike,
{
    let now = chrono::Utc::now();
    let user = repository.get_user_by_username(&params.username).await?;

    let Some(user) = user else {
        // Burn the same KDF work as the real path
        let _ = verify_password(&params.password, &DUMMY_HASH);
        logstore
            .warn(
                LogCategory::Auth,
                "login failed",
                serde_json::json!({ "username": params.username, "reason": "unknown" }),
            )
            .await;
        return Err(uniform_unauthorized());
    };

    if user.is_disabled {
        logstore
            .warn(
                LogCategory::Auth,
                "login attempt on disabled account",
                serde_json::json!({ "user_id": user.id }),
            )
            .await;
        return Err(uniform_unauthorized());
    }

    if let Some(retry_after_ms) = lockout::lock_remaining_ms(&user, now) {
        return Err(BridgeError::AccountLocked { retry_after_ms });
    }

    if !verify_password(&params.password, &user.password_hash)? {
        let failures = lockout::effective_failures(&user, now) + 1;
        let locked_until = lockout::next_lockout(failures, now);
        repository
            .record_login_failure(
                user.id,
                failures,
                locked_until,
                WrappedChronoDateTime::new(now),
            )
            .await?;

        logstore
            .warn(
                LogCategory::Auth,
                "login failed",
                serde_json::json!({
                    "user_id": user.id,
                    "failures": failures,
                    "locked": locked_until.is_some(),
                }),
            )
            .await;
        return Err(uniform_unauthorized());
    }

    repository.record_login_success(user.id).await?;

    let (session, access_token, refresh_token, expires_in) =
        mint_session(signer, &user, refresh_ttl_secs, &params, now)?;
    repository.insert_session(&session).await?;

    logstore
        .log(
            telemetry::LogLevel::Info,
            LogCategory::Auth,
            "login succeeded",
            serde_json::json!({ "user_id": user.id, "session_id": session.id }),
        )
        .await;

    Ok(LoginResult {
        access_token,
        refresh_token,
        expires_in,
        token_type: "Bearer".to_string(),
        must_rotate_password: user.must_rotate_password,
    })
}

fn mint_session(
    signer: &JwtSigner,
    user: &User,
    refresh_ttl_secs: u64,
    params: &LoginParams,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(Session, String, String, i64), BridgeError> {
    let refresh_ttl_secs = refresh_ttl_secs.max(signer.ttl_secs());
    let jti = uuid::Uuid::new_v4().to_string();
    let (access_token, claims) = signer.issue(&user.id.to_string(), &jti, user.is_admin)?;

    let refresh_token = generate_refresh_token();
    let session = Session {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user.id,
        access_token_jti: jti,
        refresh_token_hash: hash_token(&refresh_token),
        issued_at: WrappedChronoDateTime::new(now),
        expires_at: WrappedChronoDateTime::new(
            chrono::DateTime::from_timestamp(claims.exp, 0)
                .unwrap_or(now + chrono::Duration::seconds(signer.ttl_secs() as i64)),
        ),
        refresh_expires_at: WrappedChronoDateTime::new(
            now + chrono::Duration::seconds(refresh_ttl_secs as i64),
        ),
        user_agent: params.user_agent.clone(),
        remote_addr: params.remote_addr.clone(),
        revoked: false,
    };

    let expires_in = claims.exp - now.timestamp();
    Ok((session, access_token, refresh_token, expires_in))
}

/// Rotate a session off a refresh token: both the access jti and the
/// refresh token are replaced, the old refresh token stops working, and
/// the refresh horizon stays where login set it.
pub async fn refresh<R: UserRepositoryLike>(
    repository: &R,
    signer: &JwtSigner,
    refresh_token: &str,
) -> Result<RefreshResult, BridgeError> {
    let now = chrono::Utc::now();

    let session = repository
        .get_session_by_refresh_hash(&hash_token(refresh_token))
        .await?
        .ok_or_else(uniform_unauthorized)?;

    if session.revoked {
        return Err(BridgeError::TokenRevoked);
    }
    if *session.refresh_expires_at.get_inner() < now {
        return Err(BridgeError::TokenExpired);
    }

    let user = repository
        .get_user_by_id(session.user_id)
        .await?
        .ok_or_else(uniform_unauthorized)?;
    if user.is_disabled {
        return Err(uniform_unauthorized());
    }

    // Access token must not outlive the refresh horizon
    let horizon_secs = (*session.refresh_expires_at.get_inner() - now)
        .num_seconds()
        .max(1) as u64;
    let jti = uuid::Uuid::new_v4().to_string();
    let (access_token, claims) =
        signer.issue_with_ttl(&user.id.to_string(), &jti, user.is_admin, horizon_secs)?;

    let new_refresh_token = generate_refresh_token();
    repository
        .rotate_session(
            &session.id,
            &SessionRotation {
                access_token_jti: jti,
                refresh_token_hash: hash_token(&new_refresh_token),
                issued_at: WrappedChronoDateTime::new(now),
                expires_at: WrappedChronoDateTime::new(
                    chrono::DateTime::from_timestamp(claims.exp, 0)
                        .unwrap_or(now + chrono::Duration::seconds(1)),
                ),
            },
        )
        .await?;

    Ok(RefreshResult {
        access_token,
        refresh_token: new_refresh_token,
        expires_in: claims.exp - now.timestamp(),
        token_type: "Bearer".to_string(),
    })
}

/// Revoke the session behind an access token's `jti`.
pub async fn logout<R: UserRepositoryLike>(repository: &R, jti: &str) -> Result<(), BridgeError> {
    let session = repository
        .get_session_by_jti(jti)
        .await?
        .ok_or(BridgeError::TokenRevoked)?;
    repository.revoke_session(&session.id).await
}
