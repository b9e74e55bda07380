//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Clients**: Active sessions and admission rejections
//! - **Upstream**: Link state, frames by kind, reconnect attempts
//! - **Fan-out**: Frames queued and dropped per session
//! - **REST**: Query outcomes, proactive throttle waits, latency
//!
//! # Integration
//!
//! Metrics are rendered at `/metrics` on the relay's HTTP port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::LinkState;
use crate::domain::frame::FrameKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder. Later calls return the
/// handle installed by the first.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
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
    // Client gauges
    describe_gauge!("relay_clients", "Number of admitted downstream clients");
    describe_gauge!(
        "relay_subscriptions",
        "Distinct subscriptions held upstream"
    );
    describe_counter!(
        "relay_admission_rejected_total",
        "Client connections refused at capacity"
    );

    // Upstream
    describe_gauge!(
        "relay_upstream_state",
        "Upstream link state (0 disconnected, 1 connecting, 2 open, 3 closing)"
    );
    describe_counter!(
        "relay_upstream_frames_total",
        "Frames received from upstream by kind"
    );
    describe_counter!(
        "relay_reconnects_total",
        "Scheduled upstream reconnect attempts"
    );

    // Fan-out
    describe_counter!(
        "relay_messages_sent_total",
        "Frames queued to downstream clients"
    );
    describe_counter!(
        "relay_messages_dropped_total",
        "Frames dropped because a client queue was full"
    );

    // REST
    describe_counter!(
        "relay_rest_requests_total",
        "Point-in-time queries by endpoint and outcome"
    );
    describe_counter!(
        "relay_rest_throttle_waits_total",
        "Proactive waits imposed by the request quota"
    );
    describe_histogram!(
        "relay_rest_request_seconds",
        "Point-in-time query latency, waits and retries included"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

const fn state_value(state: LinkState) -> f64 {
    match state {
        LinkState::Disconnected => 0.0,
        LinkState::Connecting => 1.0,
        LinkState::Open => 2.0,
        LinkState::Closing => 3.0,
    }
}

const fn frame_label(kind: &FrameKind) -> &'static str {
    match kind {
        FrameKind::Control => "control",
        FrameKind::Data { .. } => "data",
        FrameKind::Error { .. } => "error",
    }
}

/// Update the active client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_clients(count: usize) {
    gauge!("relay_clients").set(count as f64);
}

/// Update the distinct subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("relay_subscriptions").set(count as f64);
}

/// Record a refused client connection.
pub fn record_admission_rejected() {
    counter!("relay_admission_rejected_total").increment(1);
}

/// Record the upstream link state.
pub fn record_upstream_state(state: LinkState) {
    gauge!("relay_upstream_state").set(state_value(state));
}

/// Record a frame received from upstream.
pub fn record_upstream_frame(kind: &FrameKind) {
    counter!("relay_upstream_frames_total", "kind" => frame_label(kind)).increment(1);
}

/// Record a scheduled reconnect attempt.
pub fn record_reconnect_attempt() {
    counter!("relay_reconnects_total").increment(1);
}

/// Record a frame queued to a client.
pub fn record_frame_sent() {
    counter!("relay_messages_sent_total").increment(1);
}

/// Record a frame dropped for a slow client.
pub fn record_frame_dropped() {
    counter!("relay_messages_dropped_total").increment(1);
}

/// Record a completed point-in-time query.
pub fn record_rest_request(endpoint: &str, outcome: &'static str, elapsed: Duration) {
    counter!(
        "relay_rest_requests_total",
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "relay_rest_request_seconds",
        "endpoint" => endpoint.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Record a proactive quota wait.
pub fn record_rest_throttle_wait(endpoint: &str) {
    counter!(
        "relay_rest_throttle_waits_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::subscription::Channel;

    #[test]
    fn state_values_are_distinct() {
        assert!((state_value(LinkState::Disconnected) - 0.0).abs() < f64::EPSILON);
        assert!((state_value(LinkState::Connecting) - 1.0).abs() < f64::EPSILON);
        assert!((state_value(LinkState::Open) - 2.0).abs() < f64::EPSILON);
        assert!((state_value(LinkState::Closing) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn frame_labels() {
        assert_eq!(frame_label(&FrameKind::Control), "control");
        assert_eq!(
            frame_label(&FrameKind::Data {
                channel: Channel::parse("ticker"),
                target: "XBT/USD".to_string(),
            }),
            "data"
        );
        assert_eq!(
            frame_label(&FrameKind::Error {
                target: None,
                message: "boom".to_string(),
            }),
            "error"
        );
    }

    #[test]
    fn recording_without_recorder_is_harmless() {
        set_active_clients(3);
        record_upstream_frame(&FrameKind::Control);
        record_rest_request("OHLC", "ok", Duration::from_millis(5));
    }
}
