//! HTTP middleware

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, warn};

/// Request logging middleware
pub async fn log_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    if status.is_server_error() {
        warn!(%method, path = %path, status = status.as_u16(), elapsed_ms, "Request failed");
    } else {
        debug!(%method, path = %path, status = status.as_u16(), elapsed_ms, "Request completed");
    }
    response
}
