//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTED: &str = "beacon_connected";
    pub const DISCONNECTS_TOTAL: &str = "beacon_disconnects_total";
    pub const HEARTBEATS_SENT: &str = "beacon_heartbeats_sent_total";
    pub const HEARTBEATS_RECEIVED: &str = "beacon_heartbeats_received_total";
    pub const ROUND_TRIP_SECONDS: &str = "beacon_round_trip_seconds";
    pub const EVENTS_TOTAL: &str = "beacon_events_total";
    pub const PRESENCE_MEMBERS: &str = "beacon_presence_members";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of successful connections"
    );
    metrics::describe_gauge!(names::CONNECTED, "1 while the socket is connected");
    metrics::describe_counter!(names::DISCONNECTS_TOTAL, "Total number of disconnects");
    metrics::describe_counter!(names::HEARTBEATS_SENT, "Total heartbeats sent");
    metrics::describe_counter!(
        names::HEARTBEATS_RECEIVED,
        "Total heartbeat topic messages received"
    );
    metrics::describe_histogram!(
        names::ROUND_TRIP_SECONDS,
        "Push reply round trip in seconds"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total channel events received");
    metrics::describe_gauge!(names::PRESENCE_MEMBERS, "Members present per topic");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a successful connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTED).set(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    counter!(names::DISCONNECTS_TOTAL).increment(1);
    gauge!(names::CONNECTED).set(0.0);
}

/// Record a heartbeat sent.
pub fn record_heartbeat_sent() {
    counter!(names::HEARTBEATS_SENT).increment(1);
}

/// Record a heartbeat received.
pub fn record_heartbeat_received() {
    counter!(names::HEARTBEATS_RECEIVED).increment(1);
}

/// Record a reply round trip.
pub fn record_round_trip(rtt: Duration) {
    histogram!(names::ROUND_TRIP_SECONDS).record(rtt.as_secs_f64());
}

/// Record an inbound channel event.
pub fn record_event(topic: &str, event: &str) {
    counter!(
        names::EVENTS_TOTAL,
        "topic" => topic.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Update the member count of a topic.
pub fn set_presence_members(topic: &str, count: usize) {
    gauge!(names::PRESENCE_MEMBERS, "topic" => topic.to_string()).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}
