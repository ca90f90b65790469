//! HTTP router construction.
//!
//! Assembles all Axum routes and middleware into a single `Router`.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;
use crate::{api, auth};

/// Build the complete application router with all routes and middleware.
/// `/health` stays outside the bearer check so probes work unauthenticated.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/status", get(api::fleet_status))
        .route("/v1/agents", post(api::register_agent))
        .route(
            "/v1/agents/{id}",
            get(api::get_agent).put(api::update_agent),
        )
        .route("/v1/sessions", post(api::request_session))
        .route(
            "/v1/sessions/{id}",
            get(api::get_session).delete(api::cancel_session),
        )
        .route("/v1/pools", post(api::create_pool))
        .route(
            "/v1/pools/{id}",
            get(api::get_pool).delete(api::delete_pool),
        )
        .route(
            "/v1/pools/{id}/permissions",
            get(api::pool_permissions)
                .post(api::add_permission)
                .delete(api::remove_permission),
        )
        .route("/v1/users/{id}/permissions", get(api::user_permissions))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer));

    Router::new()
        .route("/health", get(api::health))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
