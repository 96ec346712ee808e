//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (requests, latency, reloads, proxy errors)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status
//! - `gateway_request_duration_seconds` (histogram): latency by method
//! - `gateway_reloads_total` (counter): workflow reloads by outcome
//! - `gateway_proxy_errors_total` (counter): app proxy failures by kind
//! - `gateway_package_extractions_total` (counter): package pushes by outcome
//! - `gateway_uploads_total` / `gateway_upload_files_active`: recorded by the file store
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels are low-cardinality (no paths, no IDs)

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    metrics::counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "gateway_request_duration_seconds",
        "method" => method.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_reload(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("gateway_reloads_total", "outcome" => outcome).increment(1);
}

/// `kind` is `"http"` or `"websocket"`.
pub fn record_proxy_error(kind: &'static str) {
    metrics::counter!("gateway_proxy_errors_total", "kind" => kind).increment(1);
}

pub fn record_package_extraction(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("gateway_package_extractions_total", "outcome" => outcome).increment(1);
}
