//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status
//! - `gateway_request_duration_seconds` (histogram): time to response head
//! - `gateway_rate_limited_total` (counter): rejections by reason
//! - `gateway_rate_limit_clients` (gauge): tracked client addresses
//! - `gateway_workers_active` (gauge): running worker processes
//! - `gateway_downloads_total` (counter): finished downloads by outcome
//! - `gateway_bytes_streamed_total` (counter): body bytes sent to clients
//!
//! Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    metrics::counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited(reason: &'static str) {
    metrics::counter!("gateway_rate_limited_total", "reason" => reason).increment(1);
}

pub fn record_tracked_clients(count: usize) {
    metrics::gauge!("gateway_rate_limit_clients").set(count as f64);
}

pub fn record_worker_slot_acquired() {
    metrics::gauge!("gateway_workers_active").increment(1.0);
}

pub fn record_worker_slot_released() {
    metrics::gauge!("gateway_workers_active").decrement(1.0);
}

pub fn record_download(outcome: &'static str, bytes: u64) {
    metrics::counter!("gateway_downloads_total", "outcome" => outcome).increment(1);
    metrics::counter!("gateway_bytes_streamed_total").increment(bytes);
}
