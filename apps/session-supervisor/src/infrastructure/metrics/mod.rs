//! Prometheus Metrics Module
//!
//! Exposes supervisor metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Connection**: lifecycle state, connect failures, reconnects
//! - **Authentication**: re-authentication attempts by outcome
//! - **Schedule**: session intent and resolution misses
//! - **Stream**: ticks received and subscription pushes
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Connection
    describe_gauge!(
        "session_supervisor_connection_state",
        "Connection state (0=closed 1=opening 2=open 3=reauthenticating 4=closing)"
    );
    describe_counter!(
        "session_supervisor_connect_failures_total",
        "Failed connect attempts by cause"
    );
    describe_counter!(
        "session_supervisor_reconnects_total",
        "Reconnects after an unexpected disconnect"
    );
    describe_histogram!(
        "session_supervisor_connect_seconds",
        "Time from connect request to transport handshake"
    );

    // Authentication
    describe_counter!(
        "session_supervisor_reauthentications_total",
        "Re-authentication attempts by outcome"
    );

    // Schedule
    describe_gauge!(
        "session_supervisor_session_open",
        "Whether the schedule says the session is active (0/1)"
    );
    describe_counter!(
        "session_supervisor_schedule_misses_total",
        "Schedule resolutions with no matching entry"
    );

    // Stream
    describe_counter!(
        "session_supervisor_ticks_received_total",
        "Ticks received from the stream"
    );
    describe_counter!(
        "session_supervisor_subscription_pushes_total",
        "Full subscription set pushes to the live connection"
    );
    describe_gauge!(
        "session_supervisor_subscriptions",
        "Instruments in the subscription registry"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("session_supervisor_connection_state").set(f64::from(state.code()));
}

/// Record a failed connect attempt.
pub fn record_connect_failure(cause: &'static str) {
    counter!("session_supervisor_connect_failures_total", "cause" => cause).increment(1);
}

/// Record a reconnect after an unexpected disconnect.
pub fn record_reconnect() {
    counter!("session_supervisor_reconnects_total").increment(1);
}

/// Record how long a connect attempt took.
pub fn record_connect_duration(duration: Duration) {
    histogram!("session_supervisor_connect_seconds").record(duration.as_secs_f64());
}

/// Record a re-authentication attempt.
pub fn record_reauthentication(outcome: &'static str) {
    counter!("session_supervisor_reauthentications_total", "outcome" => outcome).increment(1);
}

/// Update the session intent gauge.
pub fn set_session_open(open: bool) {
    gauge!("session_supervisor_session_open").set(if open { 1.0 } else { 0.0 });
}

/// Record a schedule resolution with no matching entry.
pub fn record_schedule_miss(kind: &'static str) {
    counter!("session_supervisor_schedule_misses_total", "kind" => kind).increment(1);
}

/// Record a tick received from the stream.
pub fn record_tick() {
    counter!("session_supervisor_ticks_received_total").increment(1);
}

/// Record a subscription push.
pub fn record_subscription_push() {
    counter!("session_supervisor_subscription_pushes_total").increment(1);
}

/// Update the subscription registry size.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("session_supervisor_subscriptions").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        set_connection_state(ConnectionState::Open);
        record_connect_failure("transport");
        record_schedule_miss("MARKET");
        set_subscriptions(3);
    }

    #[test]
    fn state_gauge_codes_are_distinct() {
        let mut codes: Vec<u8> = [
            ConnectionState::Closed,
            ConnectionState::Opening,
            ConnectionState::Open,
            ConnectionState::Reauthenticating,
            ConnectionState::Closing,
        ]
        .iter()
        .map(|s| s.code())
        .collect();
        codes.dedup();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
    }
}
