//! Metrics collection and exposition.
//!
//! # Metrics
//! - `worker_tracer_workers_created_total` (counter)
//! - `worker_tracer_messages_posted_total` (counter): by `side` (host, worker)
//! - `worker_tracer_terminations_total` (counter): by `reason` (terminate, close)
//! - `worker_tracer_snapshot_requests_total` (counter)
//! - `worker_tracer_control_messages_total` (counter): by `side`, `command`
//! - `worker_tracer_unmatched_replies_total` (counter)

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Host side of the message channel.
pub const SIDE_HOST: &str = "host";
/// Worker side of the message channel.
pub const SIDE_WORKER: &str = "worker";

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_worker_created() {
    ::metrics::counter!("worker_tracer_workers_created_total").increment(1);
}

pub fn record_message_posted(side: &'static str) {
    ::metrics::counter!("worker_tracer_messages_posted_total", "side" => side).increment(1);
}

pub fn record_termination(reason: &'static str) {
    ::metrics::counter!("worker_tracer_terminations_total", "reason" => reason).increment(1);
}

pub fn record_snapshot_request() {
    ::metrics::counter!("worker_tracer_snapshot_requests_total").increment(1);
}

pub fn record_control_message(side: &'static str, command: &'static str) {
    ::metrics::counter!(
        "worker_tracer_control_messages_total",
        "side" => side,
        "command" => command
    )
    .increment(1);
}

pub fn record_unmatched_reply() {
    ::metrics::counter!("worker_tracer_unmatched_replies_total").increment(1);
}
