//! Metrics collection and export for Spjall.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use spjall_core::{Counters, Stats};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "spjall_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "spjall_connections_active";
    pub const CONNECTIONS_AUTHENTICATED: &str = "spjall_connections_authenticated";
    pub const ONLINE_USERS: &str = "spjall_online_users";
    pub const EVENTS_TOTAL: &str = "spjall_events_total";
    pub const BYTES_OUT: &str = "spjall_bytes_out_total";
    pub const DISPATCH_SECONDS: &str = "spjall_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "spjall_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections accepted since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of connections"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_AUTHENTICATED,
        "Current number of authenticated connections"
    );
    metrics::describe_gauge!(names::ONLINE_USERS, "Current number of online users");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events received and frames sent");
    metrics::describe_counter!(names::BYTES_OUT, "Total bytes queued to clients");
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Time spent handling one transport read in seconds"
    );
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

/// Record time spent handling one transport event.
pub fn record_latency(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publishes hub counters and gauges.
///
/// The hub keeps monotonic totals; the recorder forwards only the growth
/// since the previous update.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    last: Counters,
}

impl MetricsRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward changes since the last call.
    pub fn update(&mut self, counters: Counters, stats: &Stats) {
        let last = std::mem::replace(&mut self.last, counters);

        counter!(names::CONNECTIONS_TOTAL).increment(counters.accepted - last.accepted);
        counter!(names::EVENTS_TOTAL, "direction" => "inbound")
            .increment(counters.events_in - last.events_in);
        counter!(names::EVENTS_TOTAL, "direction" => "outbound")
            .increment(counters.frames_out - last.frames_out);
        counter!(names::BYTES_OUT).increment(counters.bytes_out - last.bytes_out);

        counter!(names::ERRORS_TOTAL, "type" => "refused")
            .increment(counters.refused - last.refused);
        counter!(names::ERRORS_TOTAL, "type" => "rejected_event")
            .increment(counters.errors_out - last.errors_out);
        counter!(names::ERRORS_TOTAL, "type" => "protocol")
            .increment(counters.protocol_errors - last.protocol_errors);
        counter!(names::ERRORS_TOTAL, "type" => "timeout")
            .increment(counters.timeouts - last.timeouts);

        gauge!(names::CONNECTIONS_ACTIVE).set(stats.connections as f64);
        gauge!(names::CONNECTIONS_AUTHENTICATED).set(stats.authenticated as f64);
        gauge!(names::ONLINE_USERS).set(stats.online_users as f64);
    }

    /// Counters as of the last update.
    #[must_use]
    pub fn last(&self) -> Counters {
        self.last
    }
}
