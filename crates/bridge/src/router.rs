use std::str::FromStr;
use std::time::Duration;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::HeaderMap;
use serde::Serialize;
use shared::error::BridgeError;
use utoipa::ToSchema;

use crate::logic::dispatch::{CallRequest, dispatch_tool_call};
use crate::logic::envelope::{
    BridgeInfo, InitializeBody, JsonRpcEnvelope, PROTOCOL_VERSION, ToolCallBody,
    protocol_error_for,
};
use crate::logic::queue::Priority;
use crate::service::BridgeService;

pub const SESSION_HEADER: &str = "x-session-id";
pub const PRIORITY_HEADER: &str = "x-priority";
pub const TIMEOUT_HEADER: &str = "x-timeout";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn create_router(service: BridgeService) -> Router {
    Router::new()
        .route("/mcp/initialize", post(route_initialize))
        .route("/mcp/tools/list", post(route_tools_list))
        .route("/mcp/tools/call", post(route_tools_call))
        .route("/mcp/status", get(route_status))
        .route("/health", get(route_health))
        .route("/metrics", get(route_metrics))
        .with_state(service)
}

// ============================================
// Header parsing
// ============================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_priority(headers: &HeaderMap) -> Result<Priority, BridgeError> {
    match header_str(headers, PRIORITY_HEADER) {
        Some(raw) => Priority::from_str(raw.trim()),
        None => Ok(Priority::default()),
    }
}

/// `X-Timeout` in whole seconds, clamped to the configured ceiling. A
/// value exactly at the ceiling passes through unchanged.
fn parse_timeout(headers: &HeaderMap, service: &BridgeService) -> Result<Duration, BridgeError> {
    match header_str(headers, TIMEOUT_HEADER) {
        Some(raw) => {
            let secs: u64 = raw.trim().parse().map_err(|_e| BridgeError::Malformed {
                msg: "X-Timeout must be an integer number of seconds".to_string(),
                source: None,
            })?;
            if secs == 0 {
                return Err(BridgeError::Malformed {
                    msg: "X-Timeout must be positive".to_string(),
                    source: None,
                });
            }
            Ok(Duration::from_secs(secs).min(service.config.timeout_ceiling))
        }
        None => Ok(service.config.default_timeout),
    }
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    header_str(headers, REQUEST_ID_HEADER).map(|s| s.trim().to_string())
}

// ============================================
// Handlers
// ============================================

#[derive(Debug, Serialize, ToSchema)]
struct ToolListing {
    name: String,
    description: String,
    kind: crate::logic::registry::ToolKind,
    input_schema: serde_json::Value,
}

async fn visible_tool_listings(
    service: &BridgeService,
    identity: &identity::logic::Identity,
) -> Result<Vec<ToolListing>, BridgeError> {
    let catalogue = service.registry.permission_catalogue();
    let visible = identity::logic::permission::visible_tools(
        &service.identity.repository,
        identity,
        &catalogue,
    )
    .await?;

    Ok(service
        .registry
        .tools()
        .iter()
        .filter(|tool| visible.iter().any(|name| name == tool.name))
        .map(|tool| ToolListing {
            name: tool.name.to_string(),
            description: tool.description.to_string(),
            kind: tool.kind,
            input_schema: tool.input_schema.clone(),
        })
        .collect())
}

async fn route_initialize(
    State(service): State<BridgeService>,
    headers: HeaderMap,
    body: Option<Json<InitializeBody>>,
) -> Response {
    let identity = match service.identity.auth.authenticate_from_headers(&headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let body = body.map(|Json(body)| body);
    let id = body.as_ref().and_then(|b| b.id.clone());

    if let Some(requested) = body.as_ref().and_then(|b| b.protocol_version.clone()) {
        if requested != PROTOCOL_VERSION {
            // Version negotiation is a protocol-level fault
            let err = BridgeError::UnsupportedProtocolVersion { requested };
            if let Some(rpc_error) = protocol_error_for(&err) {
                return Json(JsonRpcEnvelope::error(id, rpc_error)).into_response();
            }
            return err.into_response();
        }
    }

    let reuse = header_str(&headers, SESSION_HEADER);
    let session = service.client_sessions.initialize(identity.user_id, reuse);

    let tools = match visible_tool_listings(&service, &identity).await {
        Ok(tools) => tools,
        Err(e) => return e.into_response(),
    };

    let result = serde_json::json!({
        "session_id": session.id,
        "protocol_version": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "tools": tools,
    });
    Json(JsonRpcEnvelope::result(id, result)).into_response()
}

async fn route_tools_list(
    State(service): State<BridgeService>,
    headers: HeaderMap,
    body: Option<Json<InitializeBody>>,
) -> Response {
    let identity = match service.identity.auth.authenticate_from_headers(&headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let Some(session_id) = header_str(&headers, SESSION_HEADER) else {
        return BridgeError::Malformed {
            msg: "X-Session-ID header is required".to_string(),
            source: None,
        }
        .into_response();
    };
    if let Err(e) = service.client_sessions.validate(session_id, identity.user_id) {
        return e.into_response();
    }

    let id = body.and_then(|Json(body)| body.id);
    match visible_tool_listings(&service, &identity).await {
        Ok(tools) => Json(JsonRpcEnvelope::result(
            id,
            serde_json::json!({ "tools": tools }),
        ))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn route_tools_call(
    State(service): State<BridgeService>,
    headers: HeaderMap,
    body: Result<Json<ToolCallBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let identity = match service.identity.auth.authenticate_from_headers(&headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return BridgeError::Malformed {
                msg: format!("invalid request body: {rejection}"),
                source: None,
            }
            .into_response();
        }
    };

    let Some(session_id) = header_str(&headers, SESSION_HEADER) else {
        return BridgeError::Malformed {
            msg: "X-Session-ID header is required".to_string(),
            source: None,
        }
        .into_response();
    };
    let session = match service.client_sessions.validate(session_id, identity.user_id) {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    let priority = match parse_priority(&headers) {
        Ok(priority) => priority,
        Err(e) => return e.into_response(),
    };
    let timeout = match parse_timeout(&headers, &service) {
        Ok(timeout) => timeout,
        Err(e) => return e.into_response(),
    };

    let rpc_id = body.id.clone();
    let client_request_id = request_id(&headers);

    let call = CallRequest {
        identity,
        client_session_id: session.id.clone(),
        tool_name: body.name,
        arguments: body.arguments.unwrap_or(serde_json::Value::Null),
        priority,
        timeout,
        client_request_id: client_request_id.clone(),
    };

    match dispatch_tool_call(&service, call).await {
        Ok(outcome) => {
            let bridge_info = BridgeInfo {
                queue_wait_ms: outcome.queue_wait_ms,
                execution_time_ms: outcome.execution_time_ms,
                cached: outcome.cached,
                session_id: session.id.clone(),
                request_id: client_request_id,
            };
            Json(JsonRpcEnvelope::result(rpc_id, outcome.value).with_bridge_info(bridge_info))
                .into_response()
        }
        Err(e) => match protocol_error_for(&e) {
            // Protocol-level faults ride inside a 200
            Some(rpc_error) => {
                Json(JsonRpcEnvelope::error(rpc_id, rpc_error)).into_response()
            }
            None => e.into_response(),
        },
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct StatusResponse {
    queue_depth: usize,
    avg_exec_ms: u64,
    pool: crate::logic::pool::PoolCounts,
    breakers: Vec<crate::logic::breaker::BreakerSnapshot>,
    cache_entries: usize,
    client_sessions: usize,
}

async fn route_status(State(service): State<BridgeService>, headers: HeaderMap) -> Response {
    if let Err(e) = service.identity.auth.authenticate_from_headers(&headers).await {
        return e.into_response();
    }

    Json(StatusResponse {
        queue_depth: service.queue.depth(),
        avg_exec_ms: service.queue.avg_exec_ms(),
        pool: service.pools.total_counts(),
        breakers: service.breakers.states(),
        cache_entries: service.cache.len(),
        client_sessions: service.client_sessions.len(),
    })
    .into_response()
}

async fn route_health() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn route_metrics(State(service): State<BridgeService>, headers: HeaderMap) -> Response {
    if let Err(e) = service.identity.auth.authenticate_from_headers(&headers).await {
        return e.into_response();
    }
    Json(service.metrics.snapshot()).into_response()
}
