//! Metrics definitions for the SFU Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `method`: signaling request methods (9 values)
//! - `outcome`: `ok` or an `SfuError` label (~15 values)
//! - `actor_type`: 4 values (registry, room, connection, worker)
//! - `reason`: leave reasons (4 values)
//! - `resource`: transport, producer, consumer
//!
//! Room and peer ids are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling request latency - dominated by media worker round trips
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set request latency buckets: {e}"))?
        // Peer session length - minutes to hours
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_peer_session".to_string()),
            &[
                1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0,
            ],
        )
        .map_err(|e| format!("Failed to set peer session buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

/// Metric: `sfu_connections_active`
///
/// Open signaling connections, joined or not.
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

/// Metric: `sfu_routers_active`
pub fn set_routers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_routers_active").set(count as f64);
}

/// Metric: `sfu_workers_alive`
///
/// Anything below the configured worker count means the process is exiting.
pub fn set_workers_alive(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_workers_alive").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record one handled signaling request.
///
/// Metrics: `sfu_requests_total` (labels: `method`, `outcome`),
/// `sfu_request_duration_seconds` (labels: `method`)
pub fn record_request(method: &str, outcome: &str, duration: Duration) {
    counter!("sfu_requests_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("sfu_request_duration_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Record a frame that could not be decoded into a request.
///
/// Metric: `sfu_malformed_frames_total`
pub fn record_malformed_frame() {
    counter!("sfu_malformed_frames_total").increment(1);
}

/// Metric: `sfu_notifications_total`
/// Labels: `method`
pub fn record_notification(method: &str) {
    counter!("sfu_notifications_total", "method" => method.to_string()).increment(1);
}

// ============================================================================
// Room lifecycle
// ============================================================================

/// Record a peer leaving a room.
///
/// Metrics: `sfu_peers_removed_total` (labels: `reason`),
/// `sfu_peer_session_seconds`
pub fn record_peer_removed(reason: &str, session: Duration) {
    counter!("sfu_peers_removed_total", "reason" => reason.to_string()).increment(1);
    histogram!("sfu_peer_session_seconds").record(session.as_secs_f64());
}

/// Metric: `sfu_media_resources_created_total`
/// Labels: `resource`
pub fn record_resource_created(resource: &str) {
    counter!("sfu_media_resources_created_total", "resource" => resource.to_string())
        .increment(1);
}

// ============================================================================
// Failures
// ============================================================================

/// Metric: `sfu_worker_deaths_total`
///
/// ALERT: any non-zero value means a process restart happened.
pub fn record_worker_death() {
    counter!("sfu_worker_deaths_total").increment(1);
}

/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record messages dropped due to backpressure.
///
/// Metric: `sfu_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &str) {
    counter!("sfu_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}
