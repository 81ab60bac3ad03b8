//! Prometheus metrics for the Wirefleet server
//!
//! Exports metrics at /metrics endpoint in Prometheus format

use axum::{http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system
pub fn init_metrics() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    METRICS_HANDLE.set(handle).ok();

    gauge!("wirefleet_status_cache_entries").set(0.0);

    tracing::info!("Metrics system initialized");
    Ok(())
}

/// Handler for /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    match METRICS_HANDLE.get() {
        Some(handle) => {
            let metrics = handle.render();
            (StatusCode::OK, [("content-type", "text/plain; charset=utf-8")], metrics)
        }
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

/// A status document was built from the store
pub fn record_status_build() {
    counter!("wirefleet_status_builds_total").increment(1);
}

/// A poll was answered from the status cache
pub fn record_cache_hit() {
    counter!("wirefleet_status_cache_hits_total").increment(1);
}

/// A poll was answered with 304
pub fn record_not_modified() {
    counter!("wirefleet_status_not_modified_total").increment(1);
}

pub fn record_allocation(success: bool) {
    let result = if success { "ok" } else { "exhausted" };
    counter!("wirefleet_allocations_total", "result" => result).increment(1);
}

pub fn record_propagation_failure() {
    counter!("wirefleet_propagation_failures_total").increment(1);
}

pub fn record_invalidations(count: usize) {
    counter!("wirefleet_cache_invalidations_total").increment(count as u64);
}

pub fn set_cache_entries(count: usize) {
    gauge!("wirefleet_status_cache_entries").set(count as f64);
}
