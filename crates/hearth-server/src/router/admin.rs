use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bridge::BridgeService;
use http::HeaderMap;
use identity::logic::auth_client::require_admin;
use identity::service::IdentityService;
use serde::Serialize;
use shared::error::BridgeError;
use shared::primitives::WrappedChronoDateTime;
use telemetry::logic::logfile::RotatingLogWriter;
use telemetry::repository::{CleanupOutcome, StoreStats, TelemetryRepositoryLike};
use telemetry::{LogCategory, LogStore, Metrics};
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// State for the maintenance surface. Every route requires `is_admin`.
#[derive(Clone)]
pub struct AdminService {
    pub identity: IdentityService,
    pub bridge: BridgeService,
    pub telemetry: telemetry::repository::Repository,
    pub metrics: Metrics,
    pub logstore: LogStore<telemetry::repository::Repository>,
    pub log_writer: RotatingLogWriter,
    pub retention_days: i64,
}

pub fn create_router() -> OpenApiRouter<AdminService> {
    OpenApiRouter::new()
        .routes(routes!(route_stats))
        .routes(routes!(route_cleanup))
        .routes(routes!(route_rotate_logs))
        .routes(routes!(route_metrics))
}

async fn authenticate_admin(
    service: &AdminService,
    headers: &HeaderMap,
) -> Result<(), BridgeError> {
    let identity = service.identity.auth.authenticate_from_headers(headers).await?;
    require_admin(&identity)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminStats {
    pub store: StoreStats,
    pub queue_depth: usize,
    pub avg_exec_ms: u64,
    pub pool: bridge::logic::pool::PoolCounts,
    pub breakers: Vec<bridge::logic::breaker::BreakerSnapshot>,
    pub cache_entries: usize,
    pub cache_hit_rate: f64,
    pub client_sessions: usize,
}

/// Operational statistics
#[utoipa::path(
    get,
    path = "/admin/stats",
    tags = ["admin"],
    responses(
        (status = 200, description = "Store and runtime statistics", body = AdminStats),
        (status = 403, description = "Administrator access required", body = BridgeError),
    ),
    summary = "Admin stats",
)]
async fn route_stats(State(service): State<AdminService>, headers: HeaderMap) -> Response {
    if let Err(e) = authenticate_admin(&service, &headers).await {
        return e.into_response();
    }

    let store = match service.telemetry.stats().await {
        Ok(stats) => stats,
        Err(e) => return e.into_response(),
    };
    let snapshot = service.metrics.snapshot();

    Json(AdminStats {
        store,
        queue_depth: service.bridge.queue.depth(),
        avg_exec_ms: service.bridge.queue.avg_exec_ms(),
        pool: service.bridge.pools.total_counts(),
        breakers: service.bridge.breakers.states(),
        cache_entries: service.bridge.cache.len(),
        cache_hit_rate: snapshot.cache_hit_rate,
        client_sessions: service.bridge.client_sessions.len(),
    })
    .into_response()
}

/// Delete records past the retention horizon and compact the store
#[utoipa::path(
    post,
    path = "/admin/cleanup",
    tags = ["admin"],
    responses(
        (status = 200, description = "Rows removed; rerunning with no new writes is a no-op", body = CleanupOutcome),
        (status = 403, description = "Administrator access required", body = BridgeError),
    ),
    summary = "Retention cleanup",
)]
async fn route_cleanup(State(service): State<AdminService>, headers: HeaderMap) -> Response {
    if let Err(e) = authenticate_admin(&service, &headers).await {
        return e.into_response();
    }

    let horizon = WrappedChronoDateTime::new(
        chrono::Utc::now() - chrono::Duration::days(service.retention_days),
    );

    let outcome = match service.telemetry.cleanup(horizon).await {
        Ok(outcome) => outcome,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = service.telemetry.vacuum().await {
        return e.into_response();
    }

    service
        .logstore
        .log(
            telemetry::LogLevel::Info,
            LogCategory::Admin,
            "retention cleanup",
            serde_json::json!({
                "logs_deleted": outcome.logs_deleted,
                "requests_deleted": outcome.requests_deleted,
                "errors_deleted": outcome.errors_deleted,
            }),
        )
        .await;

    Json(outcome).into_response()
}

/// Rotate the active log file
#[utoipa::path(
    post,
    path = "/admin/logs/rotate",
    tags = ["admin"],
    responses(
        (status = 200, description = "New active log file path"),
        (status = 403, description = "Administrator access required", body = BridgeError),
    ),
    summary = "Rotate logs",
)]
async fn route_rotate_logs(State(service): State<AdminService>, headers: HeaderMap) -> Response {
    if let Err(e) = authenticate_admin(&service, &headers).await {
        return e.into_response();
    }

    match service.log_writer.rotate_now() {
        Ok(path) => {
            service
                .logstore
                .log(
                    telemetry::LogLevel::Info,
                    LogCategory::Admin,
                    "log file rotated",
                    serde_json::json!({ "active": path.display().to_string() }),
                )
                .await;
            Json(serde_json::json!({ "active": path.display().to_string() })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Metrics snapshot (admin view)
#[utoipa::path(
    get,
    path = "/admin/metrics",
    tags = ["admin"],
    responses(
        (status = 200, description = "Counters, histograms and gauges"),
        (status = 403, description = "Administrator access required", body = BridgeError),
    ),
    summary = "Admin metrics",
)]
async fn route_metrics(State(service): State<AdminService>, headers: HeaderMap) -> Response {
    if let Err(e) = authenticate_admin(&service, &headers).await {
        return e.into_response();
    }
    Json(service.metrics.snapshot()).into_response()
}
