use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use http::HeaderMap;
use shared::error::BridgeError;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::logic::api_token::{
    CreateApiTokenParams, create_api_token, list_api_tokens, revoke_api_token,
};
use crate::service::IdentityService;

pub fn create_token_routes() -> OpenApiRouter<IdentityService> {
    OpenApiRouter::new()
        .routes(routes!(route_create_token))
        .routes(routes!(route_list_tokens))
        .routes(routes!(route_revoke_token))
}

/// Create an API token
#[utoipa::path(
    post,
    path = "/auth/tokens",
    tags = ["tokens"],
    request_body = CreateApiTokenParams,
    responses(
        (status = 200, description = "Token created; the plaintext value is returned exactly once", body = crate::logic::api_token::CreateApiTokenResponse),
        (status = 401, description = "Authentication failed", body = BridgeError),
    ),
    summary = "Create API token",
)]
async fn route_create_token(
    State(service): State<IdentityService>,
    headers: HeaderMap,
    Json(params): Json<CreateApiTokenParams>,
) -> Response {
    let identity = match service.auth.authenticate_from_headers(&headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match create_api_token(&service.repository, identity.user_id, params).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

/// List the caller's API tokens
#[utoipa::path(
    get,
    path = "/auth/tokens",
    tags = ["tokens"],
    responses(
        (status = 200, description = "Tokens (hashes and plaintext never included)", body = Vec<crate::repository::ApiToken>),
        (status = 401, description = "Authentication failed", body = BridgeError),
    ),
    summary = "List API tokens",
)]
async fn route_list_tokens(State(service): State<IdentityService>, headers: HeaderMap) -> Response {
    let identity = match service.auth.authenticate_from_headers(&headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match list_api_tokens(&service.repository, identity.user_id).await {
        Ok(tokens) => Json(tokens).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Revoke an API token
#[utoipa::path(
    delete,
    path = "/auth/tokens/{token_id}",
    tags = ["tokens"],
    params(("token_id" = String, Path, description = "ID of the token to revoke")),
    responses(
        (status = 200, description = "Token revoked"),
        (status = 401, description = "Authentication failed", body = BridgeError),
        (status = 404, description = "Token not found", body = BridgeError),
    ),
    summary = "Revoke API token",
)]
async fn route_revoke_token(
    State(service): State<IdentityService>,
    headers: HeaderMap,
    Path(token_id): Path<String>,
) -> Response {
    let identity = match service.auth.authenticate_from_headers(&headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match revoke_api_token(
        &service.repository,
        identity.user_id,
        &token_id,
        identity.is_admin,
    )
    .await
    {
        Ok(()) => Json(serde_json::json!({ "revoked": true })).into_response(),
        Err(e) => e.into_response(),
    }
}
