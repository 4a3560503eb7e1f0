//! Prometheus metrics
//!
//! Counters for allocation and release outcomes plus the number of blocks
//! the node owns per pool. Exported as text at `/metrics`.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref ALLOCATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("node_ipam_allocations_total", "Address allocation requests by outcome"),
        &["pool", "result"]
    ).expect("valid metric definition");

    pub static ref RELEASES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("node_ipam_releases_total", "Address release requests by outcome"),
        &["result"]
    ).expect("valid metric definition");

    pub static ref BLOCKS_ACQUIRED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("node_ipam_blocks_acquired_total", "Blocks acquired by this node"),
        &["pool"]
    ).expect("valid metric definition");

    pub static ref OWNED_BLOCKS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("node_ipam_owned_blocks", "Blocks currently owned by this node"),
        &["pool"]
    ).expect("valid metric definition");
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(ALLOCATIONS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(RELEASES_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BLOCKS_ACQUIRED_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(OWNED_BLOCKS.clone())).ok();
}

/// Export metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}
