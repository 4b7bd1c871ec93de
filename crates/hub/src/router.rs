use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use http::HeaderMap;
use shared::error::BridgeError;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::logic::config::{HubConfigParams, create_config, update_config};
use crate::logic::probe::probe_and_record;
use crate::repository::{HubConfig, HubConfigRepositoryLike};
use crate::service::HubService;

pub fn create_router() -> OpenApiRouter<HubService> {
    OpenApiRouter::new()
        .routes(routes!(route_list_configs))
        .routes(routes!(route_create_config))
        .routes(routes!(route_update_config, route_delete_config))
        .routes(routes!(route_probe_config))
        .routes(routes!(route_set_default))
}

async fn authenticate(
    service: &HubService,
    headers: &HeaderMap,
) -> Result<identity::logic::Identity, BridgeError> {
    service.identity.auth.authenticate_from_headers(headers).await
}

/// List the caller's hub configs
#[utoipa::path(
    get,
    path = "/hub/configs",
    tags = ["hub"],
    responses(
        (status = 200, description = "Hub configs (tokens never included)", body = Vec<HubConfig>),
        (status = 401, description = "Authentication failed", body = BridgeError),
    ),
    summary = "List hub configs",
)]
async fn route_list_configs(State(service): State<HubService>, headers: HeaderMap) -> Response {
    let identity = match authenticate(&service, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match service
        .repository
        .list_configs_for_user(identity.user_id)
        .await
    {
        Ok(configs) => Json(configs).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Create a hub config
#[utoipa::path(
    post,
    path = "/hub/configs",
    tags = ["hub"],
    request_body = HubConfigParams,
    responses(
        (status = 200, description = "Config created; the token is encrypted at rest", body = HubConfig),
        (status = 400, description = "Invalid url or missing token", body = BridgeError),
        (status = 409, description = "Name already in use", body = BridgeError),
    ),
    summary = "Create hub config",
)]
async fn route_create_config(
    State(service): State<HubService>,
    headers: HeaderMap,
    Json(params): Json<HubConfigParams>,
) -> Response {
    let identity = match authenticate(&service, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match create_config(
        &service.repository,
        &service.crypto,
        identity.user_id,
        params,
        service.forbid_loopback,
    )
    .await
    {
        Ok(config) => Json(config).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Update a hub config
#[utoipa::path(
    put,
    path = "/hub/configs/{config_id}",
    tags = ["hub"],
    params(("config_id" = String, Path, description = "Config to update")),
    request_body = HubConfigParams,
    responses(
        (status = 200, description = "Config updated; omitting the token keeps the stored one", body = HubConfig),
        (status = 404, description = "Config not found", body = BridgeError),
    ),
    summary = "Update hub config",
)]
async fn route_update_config(
    State(service): State<HubService>,
    headers: HeaderMap,
    Path(config_id): Path<String>,
    Json(params): Json<HubConfigParams>,
) -> Response {
    let identity = match authenticate(&service, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match update_config(
        &service.repository,
        &service.crypto,
        identity.user_id,
        &config_id,
        params,
        service.forbid_loopback,
    )
    .await
    {
        Ok(config) => Json(config).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Delete a hub config
#[utoipa::path(
    delete,
    path = "/hub/configs/{config_id}",
    tags = ["hub"],
    params(("config_id" = String, Path, description = "Config to delete")),
    responses(
        (status = 200, description = "Config deleted"),
        (status = 404, description = "Config not found", body = BridgeError),
    ),
    summary = "Delete hub config",
)]
async fn route_delete_config(
    State(service): State<HubService>,
    headers: HeaderMap,
    Path(config_id): Path<String>,
) -> Response {
    let identity = match authenticate(&service, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match service
        .repository
        .delete_config(&config_id, identity.user_id)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "deleted": true })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Probe a hub config
#[utoipa::path(
    post,
    path = "/hub/configs/{config_id}/probe",
    tags = ["hub"],
    params(("config_id" = String, Path, description = "Config to probe")),
    responses(
        (status = 200, description = "Probe outcome", body = crate::logic::probe::ProbeOutcome),
        (status = 404, description = "Config not found", body = BridgeError),
    ),
    summary = "Probe hub config",
    description = "Performs a lightweight authenticated request against the upstream and records latency, version and entity count",
)]
async fn route_probe_config(
    State(service): State<HubService>,
    headers: HeaderMap,
    Path(config_id): Path<String>,
) -> Response {
    let identity = match authenticate(&service, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let config = match service
        .repository
        .get_config(&config_id, identity.user_id)
        .await
    {
        Ok(Some(config)) => config,
        Ok(None) => {
            return BridgeError::NotFound {
                msg: "hub config not found".to_string(),
                lookup_id: config_id,
            }
            .into_response();
        }
        Err(e) => return e.into_response(),
    };

    match probe_and_record(
        &service.repository,
        &service.logstore,
        &service.crypto,
        &service.http,
        &config,
    )
    .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Make a config the default
#[utoipa::path(
    post,
    path = "/hub/configs/{config_id}/default",
    tags = ["hub"],
    params(("config_id" = String, Path, description = "Config to promote")),
    responses(
        (status = 200, description = "Default switched atomically"),
        (status = 404, description = "Config not found", body = BridgeError),
    ),
    summary = "Set default hub config",
)]
async fn route_set_default(
    State(service): State<HubService>,
    headers: HeaderMap,
    Path(config_id): Path<String>,
) -> Response {
    let identity = match authenticate(&service, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match service
        .repository
        .set_default_config(identity.user_id, &config_id)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "default": config_id })).into_response(),
        Err(e) => e.into_response(),
    }
}
