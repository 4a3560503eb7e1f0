//! Health check endpoints for Kubernetes probes
//!
//! - Liveness: the process answers
//! - Readiness: local state was recovered from the store

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// "healthy" or "starting"
    pub status: String,
    pub ready: bool,
    pub alive: bool,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Health check manager
#[derive(Debug)]
pub struct HealthChecker {
    start_time: Instant,
    is_ready: RwLock<bool>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            is_ready: RwLock::new(false),
        }
    }

    /// Mark as ready
    pub async fn set_ready(&self) {
        *self.is_ready.write().await = true;
        info!("Health checker: agent is READY");
    }

    /// Mark as not ready
    pub async fn set_not_ready(&self) {
        *self.is_ready.write().await = false;
        warn!("Health checker: agent is NOT READY");
    }

    pub async fn get_status(&self) -> HealthStatus {
        let ready = *self.is_ready.read().await;
        HealthStatus {
            status: if ready { "healthy" } else { "starting" }.to_string(),
            ready,
            alive: true,
            version: crate::VERSION.to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}
