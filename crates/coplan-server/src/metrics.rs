//! Prometheus instrumentation for the gateway.
//!
//! Socket-level numbers only: handshakes, frames in and out, handling
//! latency and the rooms this instance holds members for. Bus and presence
//! health show up in the logs, not here.

use coplan_core::AuthError;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "coplan_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "coplan_connections_active";
    pub const MESSAGES_TOTAL: &str = "coplan_messages_total";
    pub const MESSAGES_BYTES: &str = "coplan_messages_bytes";
    pub const ROOMS_ACTIVE: &str = "coplan_rooms_active";
    pub const AUTH_FAILURES_TOTAL: &str = "coplan_auth_failures_total";
    pub const LATENCY_SECONDS: &str = "coplan_latency_seconds";
    pub const ERRORS_TOTAL: &str = "coplan_errors_total";
}

/// Which way a frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to gateway.
    Inbound,
    /// Gateway to client, including bus deliveries.
    Outbound,
}

impl Direction {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Label for a rejected handshake.
#[must_use]
pub fn rejection_reason(error: &AuthError) -> &'static str {
    match error {
        AuthError::MissingCredential => "missing",
        AuthError::InvalidCredential(_) => "invalid",
        AuthError::Expired => "expired",
        AuthError::Unavailable(_) => "unavailable",
    }
}

/// Register metric descriptions.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Sockets that passed the handshake since start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Authenticated sockets currently open"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Frames by direction");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Frame bytes by direction");
    metrics::describe_gauge!(
        names::ROOMS_ACTIVE,
        "Student rooms with at least one member on this instance"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Handshakes closed with a policy violation, by reason"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Time to apply one inbound frame, publish included"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Socket errors by type");

    info!("Metrics initialized");
}

/// Serve `/metrics` on its own port.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind or install its recorder.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Count a frame.
pub fn record_frame(direction: Direction, bytes: usize) {
    let label = direction.label();
    counter!(names::MESSAGES_TOTAL, "direction" => label).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => label).increment(bytes as u64);
}

/// Record how long an inbound frame took and the room count it left behind.
pub fn record_frame_handled(elapsed: Duration, local_rooms: usize) {
    histogram!(names::LATENCY_SECONDS).record(elapsed.as_secs_f64());
    set_local_rooms(local_rooms);
}

pub fn set_local_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Count a handshake closed with 1008.
pub fn record_rejected_handshake(error: &AuthError) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => rejection_reason(error)).increment(1);
}

pub fn record_socket_error() {
    counter!(names::ERRORS_TOTAL, "type" => "websocket").increment(1);
}

/// Keeps `coplan_connections_active` in step with an open socket.
pub struct SocketGauge;

impl SocketGauge {
    /// Count an authenticated socket as open until the guard drops.
    #[must_use]
    pub fn open() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for SocketGauge {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
