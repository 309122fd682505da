//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by kind (http/websocket), status
//! - `proxy_request_duration_seconds` (histogram): time to first response byte
//! - `proxy_upstream_errors_total` (counter): failed upstream connects by kind
//! - `proxy_websocket_sessions_active` (gauge): relayed sessions in flight
//!
//! Recording is a no-op until a recorder is installed with [`init_metrics`].

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(kind: &'static str, status: u16, start: Instant) {
    counter!("proxy_requests_total", "kind" => kind, "status" => status.to_string()).increment(1);
    histogram!("proxy_request_duration_seconds", "kind" => kind)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error(kind: &'static str) {
    counter!("proxy_upstream_errors_total", "kind" => kind).increment(1);
}

/// Counts one live WebSocket session for as long as it is held.
#[derive(Debug)]
pub struct SessionGauge(());

impl SessionGauge {
    pub fn open() -> Self {
        gauge!("proxy_websocket_sessions_active").increment(1.0);
        Self(())
    }
}

impl Drop for SessionGauge {
    fn drop(&mut self) {
        gauge!("proxy_websocket_sessions_active").decrement(1.0);
    }
}
