//! HTTP routes definition

use axum::{
    extract::Extension,
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;

use super::{handlers, AppState, HealthStatus};

/// Address routes
///
/// - POST   /ip                                - Allocate an address
/// - GET    /ip/:container_id                  - Look up a container's address
/// - DELETE /ip/:namespace/:pod/:container_id  - Release a pod's address
pub fn ip_routes() -> Router {
    Router::new()
        .route("/ip", post(handlers::allocate_ip))
        .route("/ip/:container_id", get(handlers::get_ip))
        .route(
            "/ip/:namespace/:pod/:container_id",
            delete(handlers::delete_ip),
        )
}

/// Node status routes
pub fn status_routes() -> Router {
    Router::new().route("/status", get(handlers::node_status))
}

/// Health check routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics_endpoint))
}

/// Liveness probe (K8s)
async fn health_live(Extension(state): Extension<Arc<AppState>>) -> Json<HealthStatus> {
    Json(state.health.get_status().await)
}

/// Readiness probe (K8s)
async fn health_ready(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<HealthStatus>, (StatusCode, String)> {
    let status = state.health.get_status().await;
    if status.ready {
        Ok(Json(status))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, "Not ready".to_string()))
    }
}

/// Prometheus metrics endpoint
async fn metrics_endpoint() -> String {
    crate::metrics::export_metrics()
}
