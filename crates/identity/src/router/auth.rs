use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use http::HeaderMap;
use serde::Deserialize;
use shared::error::BridgeError;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::logic::auth_client::Identity;
use crate::logic::session::{LoginParams, RefreshParams, login, refresh};
use crate::logic::user::change_password;
use crate::repository::UserRepositoryLike;
use crate::service::IdentityService;

use super::{add_refresh_cookie, refresh_token_from_jar, remove_refresh_cookie};

pub fn create_auth_routes() -> OpenApiRouter<IdentityService> {
    OpenApiRouter::new()
        .routes(routes!(route_login))
        .routes(routes!(route_refresh))
        .routes(routes!(route_logout))
        .routes(routes!(route_whoami))
        .routes(routes!(route_change_password))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn remote_addr(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
}

/// Log in with username and password
#[utoipa::path(
    post,
    path = "/auth/login",
    tags = ["auth"],
    request_body = LoginParams,
    responses(
        (status = 200, description = "Login successful", body = crate::logic::session::LoginResult),
        (status = 401, description = "Invalid credentials", body = BridgeError),
        (status = 423, description = "Account locked", body = BridgeError),
    ),
    summary = "Log in",
    description = "Verifies a username/password pair and issues an access token plus refresh token",
)]
async fn route_login(
    State(service): State<IdentityService>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(mut params): Json<LoginParams>,
) -> Response {
    params.user_agent = user_agent(&headers);
    params.remote_addr = remote_addr(&headers);

    match login(
        &service.repository,
        &service.logstore,
        service.auth.jwt_signer(),
        service.refresh_ttl_secs,
        params,
    )
    .await
    {
        Ok(result) => {
            let jar = add_refresh_cookie(jar, &result.refresh_token);
            (jar, Json(result)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Refresh the access token
#[utoipa::path(
    post,
    path = "/auth/refresh",
    tags = ["auth"],
    request_body(content = Option<RefreshParams>, description = "Optional refresh token in body. If not provided, will be read from cookie."),
    responses(
        (status = 200, description = "Token refresh successful", body = crate::logic::session::RefreshResult),
        (status = 401, description = "Authentication failed", body = BridgeError),
    ),
    summary = "Refresh access token",
    description = "Rotates the session: a new access token and refresh token are issued, the old refresh token stops working",
)]
async fn route_refresh(
    State(service): State<IdentityService>,
    jar: CookieJar,
    body: Option<Json<RefreshParams>>,
) -> Response {
    let refresh_token = body
        .and_then(|b| b.refresh_token.clone())
        .or_else(|| refresh_token_from_jar(&jar));

    let Some(refresh_token) = refresh_token else {
        return BridgeError::Unauthorized {
            msg: "no refresh token provided in body or cookie".to_string(),
            source: None,
        }
        .into_response();
    };

    match refresh(&service.repository, service.auth.jwt_signer(), &refresh_token).await {
        Ok(result) => {
            let jar = add_refresh_cookie(jar, &result.refresh_token);
            (jar, Json(result)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Log out (revoke the current session)
#[utoipa::path(
    post,
    path = "/auth/logout",
    tags = ["auth"],
    responses(
        (status = 200, description = "Session revoked"),
        (status = 401, description = "Authentication failed", body = BridgeError),
    ),
    summary = "Log out",
    description = "Revokes the session behind the presented access token; the token and its refresh token stop working",
)]
async fn route_logout(
    State(service): State<IdentityService>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    let identity = match service.auth.authenticate_from_headers(&headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let Some(session_id) = identity.session_id else {
        return BridgeError::InvalidArgument {
            msg: "logout requires a session token, not an API token".to_string(),
        }
        .into_response();
    };

    match service.repository.revoke_session(&session_id).await {
        Ok(()) => {
            let jar = remove_refresh_cookie(jar);
            (jar, Json(serde_json::json!({ "revoked": true }))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Get the current authenticated identity
#[utoipa::path(
    get,
    path = "/auth/whoami",
    tags = ["auth"],
    responses(
        (status = 200, description = "Current authenticated identity", body = Identity),
        (status = 401, description = "Authentication failed", body = BridgeError),
    ),
    summary = "Get current identity",
)]
async fn route_whoami(State(service): State<IdentityService>, headers: HeaderMap) -> Response {
    match service.auth.authenticate_from_headers(&headers).await {
        Ok(identity) => Json(identity).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Change the caller's password
#[utoipa::path(
    post,
    path = "/auth/password",
    tags = ["auth"],
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed"),
        (status = 401, description = "Authentication failed", body = BridgeError),
    ),
    summary = "Change password",
    description = "Verifies the current password and replaces it; clears any pending rotation requirement",
)]
async fn route_change_password(
    State(service): State<IdentityService>,
    headers: HeaderMap,
    Json(body): Json<ChangePasswordRequest>,
) -> Response {
    let identity = match service.auth.authenticate_from_headers(&headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match change_password(
        &service.repository,
        identity.user_id,
        &body.current_password,
        &body.new_password,
    )
    .await
    {
        Ok(()) => Json(serde_json::json!({ "changed": true })).into_response(),
        Err(e) => e.into_response(),
    }
}
