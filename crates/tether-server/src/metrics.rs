//! Metrics collection and export for tether.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SOCKETS_TOTAL: &str = "tether_sockets_total";
    pub const SOCKETS_ACTIVE: &str = "tether_sockets_active";
    pub const ROOMS_ACTIVE: &str = "tether_rooms_active";
    pub const BROADCASTS_TOTAL: &str = "tether_broadcasts_total";
    pub const UPGRADE_REJECTIONS_TOTAL: &str = "tether_upgrade_rejections_total";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Describe every metric.
pub fn init_metrics() {
    metrics::describe_counter!(names::SOCKETS_TOTAL, "Sockets accepted since server start");
    metrics::describe_gauge!(names::SOCKETS_ACTIVE, "Currently registered sockets");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Currently running rooms");
    metrics::describe_counter!(names::BROADCASTS_TOTAL, "Payloads queued for room broadcast");
    metrics::describe_counter!(
        names::UPGRADE_REJECTIONS_TOTAL,
        "Upgrade requests rejected before a socket was created"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a payload queued for broadcast.
pub fn record_broadcast(room: &str) {
    counter!(names::BROADCASTS_TOTAL, "room" => room.to_string()).increment(1);
}

/// Record a rejected upgrade.
pub fn record_rejection(reason: &'static str) {
    counter!(names::UPGRADE_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Update the running room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Records a socket on creation and its disconnect on drop.
pub struct SocketMetricsGuard;

impl SocketMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SOCKETS_TOTAL).increment(1);
        gauge!(names::SOCKETS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SocketMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SocketMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SOCKETS_ACTIVE).decrement(1.0);
    }
}
