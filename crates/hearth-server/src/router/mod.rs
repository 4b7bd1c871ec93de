pub mod admin;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::factory::ApiService;

/// Assemble the full HTTP surface: the JSON-RPC bridge routes, the
/// OpenAPI-documented management routes, and the admin surface.
pub fn build_app(api_service: &ApiService) -> Router {
    let (identity_router, _identity_api) = identity::router::create_router().split_for_parts();
    let identity_router = identity_router.with_state(api_service.identity_service.clone());

    let (hub_router, _hub_api) = hub::router::create_router().split_for_parts();
    let hub_router = hub_router.with_state(api_service.hub_service.clone());

    let (admin_router, _admin_api) = admin::create_router().split_for_parts();
    let admin_router = admin_router.with_state(api_service.admin_service.clone());

    bridge::router::create_router(api_service.bridge_service.clone())
        .merge(identity_router)
        .merge(hub_router)
        .merge(admin_router)
        .layer(CorsLayer::permissive())
}
