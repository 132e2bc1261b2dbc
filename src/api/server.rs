// # Control-plane router
//
// Route table and middleware for the control plane. Mounted behind the
// inbound demux, never on its own listener.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use super::handlers::{leases, nodes, platforms, rules, subscriptions, system};
use super::types::require_admin;
use super::ApiState;

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(system::root))
        .route("/healthz", get(system::healthz))
        .route("/api/v1/system/info", get(system::get_info))
        .route(
            "/api/v1/system/config",
            get(system::get_config).patch(system::patch_config),
        )
        .route(
            "/api/v1/platforms",
            get(platforms::list).post(platforms::create),
        )
        .route(
            "/api/v1/platforms/{id}",
            get(platforms::get)
                .patch(platforms::patch)
                .delete(platforms::delete),
        )
        .route("/api/v1/platforms/{id}/reset", post(platforms::reset))
        .route(
            "/api/v1/platforms/{id}/rebuild-view",
            post(platforms::rebuild_view),
        )
        .route(
            "/api/v1/subscriptions",
            get(subscriptions::list).post(subscriptions::create),
        )
        .route(
            "/api/v1/subscriptions/{id}",
            get(subscriptions::get)
                .patch(subscriptions::patch)
                .delete(subscriptions::delete),
        )
        .route(
            "/api/v1/subscriptions/{id}/refresh",
            post(subscriptions::refresh),
        )
        .route(
            "/api/v1/subscriptions/{id}/cleanup-unhealthy",
            post(subscriptions::cleanup_unhealthy),
        )
        .route("/api/v1/nodes", get(nodes::list))
        .route("/api/v1/nodes/{hash}", get(nodes::get))
        .route("/api/v1/nodes/{hash}/probe/{kind}", post(nodes::probe))
        .route("/api/v1/nodes/{hash}/circuit", post(nodes::circuit))
        .route("/api/v1/leases", get(leases::list))
        .route(
            "/api/v1/leases/{platform_id}/{account}",
            get(leases::get).delete(leases::delete),
        )
        .route(
            "/api/v1/account-header-rules",
            get(rules::list).post(rules::upsert).delete(rules::delete),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
