//! HTTP route handlers

use axum::{
    extract::{rejection::JsonRejection, Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, instrument};

use crate::error::{Error, ErrorKind};
use crate::ipam::{with_deadline, NodeStatus};
use crate::server::AppState;

/// Allocation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocateRequest {
    #[serde(rename = "pod-namespace", default)]
    pub pod_namespace: String,
    #[serde(rename = "pod-name", default)]
    pub pod_name: String,
    #[serde(rename = "container-id", default)]
    pub container_id: String,
}

/// Address response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfoResponse {
    /// Empty when a release found nothing to free
    pub address: String,
    pub status: u16,
}

impl AddressInfoResponse {
    fn ok(address: String) -> Self {
        Self {
            address,
            status: StatusCode::OK.as_u16(),
        }
    }
}

/// Error rendered as `{"status": .., "error": ..}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match e.kind() {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::CapacityUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => {
                error!(error = %e, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "status": self.status.as_u16(),
                "error": self.message,
            })),
        )
            .into_response()
    }
}

fn require(value: &str, message: &str) -> Result<(), ApiError> {
    if value.is_empty() {
        return Err(ApiError::bad_request(message));
    }
    Ok(())
}

/// Allocate an address for a new pod
#[instrument(skip(state, payload))]
pub async fn allocate_ip(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<AllocateRequest>, JsonRejection>,
) -> Result<Json<AddressInfoResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    require(&req.pod_namespace, "no pod namespace")?;
    require(&req.pod_name, "no pod name")?;
    require(&req.container_id, "no container-id")?;

    let address = with_deadline(
        state.request_timeout,
        state
            .engine
            .allocate(&req.container_id, &req.pod_namespace, &req.pod_name),
    )
    .await?;

    Ok(Json(AddressInfoResponse::ok(address.to_string())))
}

/// Address held by a container
#[instrument(skip(state))]
pub async fn get_ip(
    Extension(state): Extension<Arc<AppState>>,
    Path(container_id): Path<String>,
) -> Result<Json<AddressInfoResponse>, ApiError> {
    let address = with_deadline(state.request_timeout, state.engine.lookup(&container_id)).await?;
    Ok(Json(AddressInfoResponse::ok(address.to_string())))
}

/// Release the address of a deleted pod
///
/// Never answers 404: deleting twice is fine.
#[instrument(skip(state))]
pub async fn delete_ip(
    Extension(state): Extension<Arc<AppState>>,
    Path((namespace, pod_name, container_id)): Path<(String, String, String)>,
) -> Result<Json<AddressInfoResponse>, ApiError> {
    let released = with_deadline(
        state.request_timeout,
        state.engine.release_pod(&namespace, &pod_name, &container_id),
    )
    .await?;

    let address = released.map(|ip| ip.to_string()).unwrap_or_default();
    Ok(Json(AddressInfoResponse::ok(address)))
}

/// Blocks and containers known to this node
pub async fn node_status(Extension(state): Extension<Arc<AppState>>) -> Json<NodeStatus> {
    Json(state.engine.status())
}
