//! Metrics implementation using Prometheus.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use capgraph_core::{Error, Result};
use std::time::Duration;

/// Initialize Prometheus recorder and return the handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let builder = PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .map_err(|e| Error::configuration(format!("Failed to install Prometheus recorder: {}", e)))?;

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// Helper to track HTTP request metrics (latency, count).
pub fn track_request(method: &str, path: &str, status: u16, latency_sec: f64) {
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(latency_sec);
}

/// Track one tracked capability invocation.
pub fn track_capability(capability: &str, success: bool, duration: Duration) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!(
        "capability_invocations_total",
        "capability" => capability.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    metrics::histogram!(
        "capability_duration_seconds",
        "capability" => capability.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Track a router decision by label and how it was reached.
pub fn track_route_decision(label: &str, source: &str) {
    metrics::counter!(
        "route_decisions_total",
        "label" => label.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Track a completed turn by protocol mode and outcome.
pub fn track_turn(mode: &str, outcome: &str) {
    metrics::counter!(
        "turns_total",
        "mode" => mode.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
