//! Metrics collection and exposition.
//!
//! # Metrics
//! - `transport_listeners_created_total` (counter): by kind
//! - `transport_listener_failures_total` (counter): by kind
//! - `transport_socket_probes_total` (counter): by resulting state
//! - `transport_tls_handshakes_total` (counter): by side and outcome
//! - `transport_trust_prompts_total` (counter): by failure kind and answer

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::bind::TransportKind;
use crate::net::SocketPathState;
use crate::tls::TlsSide;

/// Start the Prometheus exporter. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_listener_created(kind: TransportKind) {
    metrics::counter!("transport_listeners_created_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_listener_failure(kind: TransportKind) {
    metrics::counter!("transport_listener_failures_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_probe(state: SocketPathState) {
    metrics::counter!("transport_socket_probes_total", "state" => state.as_str()).increment(1);
}

pub fn record_handshake(side: TlsSide, outcome: &str) {
    metrics::counter!(
        "transport_tls_handshakes_total",
        "side" => side.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_trust_prompt(kind: &str, accepted: bool) {
    metrics::counter!(
        "transport_trust_prompts_total",
        "kind" => kind.to_string(),
        "accepted" => if accepted { "yes" } else { "no" }
    )
    .increment(1);
}
