use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use http::HeaderMap;
use serde::Deserialize;
use shared::error::BridgeError;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::logic::auth_client::{Identity, require_admin};
use crate::logic::user::{CreateUserParams, create_user};
use crate::repository::{PermissionBits, ToolPermission, UserRepositoryLike};
use crate::service::IdentityService;

pub fn create_user_admin_routes() -> OpenApiRouter<IdentityService> {
    OpenApiRouter::new()
        .routes(routes!(route_list_users))
        .routes(routes!(route_create_user))
        .routes(routes!(route_set_disabled))
        .routes(routes!(route_list_permissions))
        .routes(routes!(route_set_permission))
        .routes(routes!(route_clear_permission))
}

async fn authenticate_admin(
    service: &IdentityService,
    headers: &HeaderMap,
) -> Result<Identity, BridgeError> {
    let identity = service.auth.authenticate_from_headers(headers).await?;
    require_admin(&identity)?;
    Ok(identity)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetDisabledRequest {
    pub disabled: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetPermissionRequest {
    pub tool_name: String,
    pub can_read: bool,
    pub can_write: bool,
    pub can_execute: bool,
    pub enabled: bool,
}

/// List all users
#[utoipa::path(
    get,
    path = "/admin/users",
    tags = ["admin"],
    responses(
        (status = 200, description = "All user accounts", body = Vec<crate::repository::User>),
        (status = 403, description = "Administrator access required", body = BridgeError),
    ),
    summary = "List users",
)]
async fn route_list_users(State(service): State<IdentityService>, headers: HeaderMap) -> Response {
    if let Err(e) = authenticate_admin(&service, &headers).await {
        return e.into_response();
    }

    match service.repository.list_users().await {
        Ok(users) => Json(users).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Create a user
#[utoipa::path(
    post,
    path = "/admin/users",
    tags = ["admin"],
    request_body = CreateUserParams,
    responses(
        (status = 200, description = "User created", body = crate::repository::User),
        (status = 403, description = "Administrator access required", body = BridgeError),
        (status = 409, description = "Username or email taken", body = BridgeError),
    ),
    summary = "Create user",
)]
async fn route_create_user(
    State(service): State<IdentityService>,
    headers: HeaderMap,
    Json(params): Json<CreateUserParams>,
) -> Response {
    if let Err(e) = authenticate_admin(&service, &headers).await {
        return e.into_response();
    }

    match create_user(&service.repository, params).await {
        Ok(user) => Json(user).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Enable or disable an account
#[utoipa::path(
    post,
    path = "/admin/users/{user_id}/disabled",
    tags = ["admin"],
    params(("user_id" = i64, Path, description = "User to update")),
    request_body = SetDisabledRequest,
    responses(
        (status = 200, description = "Account flag updated"),
        (status = 403, description = "Administrator access required", body = BridgeError),
    ),
    summary = "Soft-disable user",
    description = "Accounts referenced by request or log records are never hard-deleted; disabling blocks all authentication instead",
)]
async fn route_set_disabled(
    State(service): State<IdentityService>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Json(body): Json<SetDisabledRequest>,
) -> Response {
    let admin = match authenticate_admin(&service, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    if admin.user_id == user_id && body.disabled {
        return BridgeError::InvalidArgument {
            msg: "refusing to disable the calling admin account".to_string(),
        }
        .into_response();
    }

    let result = async {
        service.repository.set_disabled(user_id, body.disabled).await?;
        if body.disabled {
            service.repository.revoke_sessions_for_user(user_id).await?;
        }
        Ok::<_, BridgeError>(())
    }
    .await;

    match result {
        Ok(()) => Json(serde_json::json!({ "disabled": body.disabled })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// List a user's tool permission overrides
#[utoipa::path(
    get,
    path = "/admin/users/{user_id}/permissions",
    tags = ["admin"],
    params(("user_id" = i64, Path, description = "User to inspect")),
    responses(
        (status = 200, description = "Per-tool overrides (tools without one inherit the defaults)", body = Vec<ToolPermission>),
        (status = 403, description = "Administrator access required", body = BridgeError),
    ),
    summary = "List tool permissions",
)]
async fn route_list_permissions(
    State(service): State<IdentityService>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Response {
    if let Err(e) = authenticate_admin(&service, &headers).await {
        return e.into_response();
    }

    match service.repository.list_tool_permissions(user_id).await {
        Ok(permissions) => Json(permissions).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Set a per-user tool permission override
#[utoipa::path(
    put,
    path = "/admin/users/{user_id}/permissions",
    tags = ["admin"],
    params(("user_id" = i64, Path, description = "User to update")),
    request_body = SetPermissionRequest,
    responses(
        (status = 200, description = "Override stored"),
        (status = 403, description = "Administrator access required", body = BridgeError),
    ),
    summary = "Set tool permission",
)]
async fn route_set_permission(
    State(service): State<IdentityService>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Json(body): Json<SetPermissionRequest>,
) -> Response {
    if let Err(e) = authenticate_admin(&service, &headers).await {
        return e.into_response();
    }

    let permission = ToolPermission {
        user_id,
        tool_name: body.tool_name,
        bits: PermissionBits {
            can_read: body.can_read,
            can_write: body.can_write,
            can_execute: body.can_execute,
            enabled: body.enabled,
        },
    };

    match service.repository.set_tool_permission(&permission).await {
        Ok(()) => Json(serde_json::json!({ "updated": true })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Remove a per-user override (fall back to the default)
#[utoipa::path(
    delete,
    path = "/admin/users/{user_id}/permissions/{tool_name}",
    tags = ["admin"],
    params(
        ("user_id" = i64, Path, description = "User to update"),
        ("tool_name" = String, Path, description = "Tool whose override to remove"),
    ),
    responses(
        (status = 200, description = "Override removed"),
        (status = 403, description = "Administrator access required", body = BridgeError),
    ),
    summary = "Clear tool permission",
)]
async fn route_clear_permission(
    State(service): State<IdentityService>,
    headers: HeaderMap,
    Path((user_id, tool_name)): Path<(i64, String)>,
) -> Response {
    if let Err(e) = authenticate_admin(&service, &headers).await {
        return e.into_response();
    }

    match service
        .repository
        .clear_tool_permission(user_id, &tool_name)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "cleared": true })).into_response(),
        Err(e) => e.into_response(),
    }
}
