//! HTTP API of the agent
//!
//! The CNI plugin on the node talks to these endpoints: one `POST /ip` per
//! pod creation, one `DELETE /ip/...` per pod deletion, and `GET /ip/...`
//! for idempotency checks.

pub mod handlers;
pub mod health;
pub mod middleware;
pub mod routes;

use axum::{extract::Extension, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::ipam::IpamEngine;

pub use handlers::{AddressInfoResponse, AllocateRequest, ApiError};
pub use health::{HealthChecker, HealthStatus};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<IpamEngine>,
    pub health: Arc<HealthChecker>,
    /// Upper bound for one engine call
    pub request_timeout: Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("node", &self.engine.node_name())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl AppState {
    pub fn new(engine: Arc<IpamEngine>, request_timeout: Duration) -> Self {
        Self {
            engine,
            health: Arc::new(HealthChecker::new()),
            request_timeout,
        }
    }
}

/// Build the router with all routes
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::ip_routes())
        .merge(routes::status_routes())
        .merge(routes::health_routes())
        .layer(axum::middleware::from_fn(middleware::log_request))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

/// Start the agent's HTTP server
///
/// Rebuilds local state from the store first; the readiness probe turns
/// green only after that succeeded.
pub async fn start_server(config: AgentConfig, engine: Arc<IpamEngine>) -> anyhow::Result<()> {
    info!(
        addr = %config.listen_addr,
        node = %config.node_name,
        dry_run = config.dry_run,
        "Starting node IPAM agent"
    );

    crate::metrics::init_metrics();

    let state = Arc::new(AppState::new(engine.clone(), config.request_timeout()));

    match engine.recover().await {
        Ok(containers) => {
            state.health.set_ready().await;
            info!(containers = containers, "Startup complete");
        }
        Err(e) => {
            error!(error = %e, "Failed to recover state from store");
            return Err(anyhow::anyhow!("state recovery failed: {}", e));
        }
    }

    let app = build_router(state);
    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Server listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error = %e, "Server error");
            anyhow::anyhow!("Server failed: {}", e)
        })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
