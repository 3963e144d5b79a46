//! Metric definitions for the call session.
//!
//! All metrics follow Prometheus naming conventions:
//! - `call_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Every label value is a `&'static str` taken from a bounded enum, so no
//! metric exceeds a few dozen label combinations.

use metrics::{counter, histogram};
use std::time::Duration;

/// Record a join attempt.
///
/// Metric: `call_joins_total`
/// Labels: `role` (offerer, answerer, none), `outcome` (success, full, error)
///
/// Cardinality: 9
pub fn record_join(role: &'static str, outcome: &'static str) {
    counter!("call_joins_total", "role" => role, "outcome" => outcome).increment(1);
}

/// Record a session close.
///
/// Metric: `call_leaves_total`
/// Labels: `reason` (bounded by `CloseReason`)
///
/// Cardinality: 7
pub fn record_leave(reason: &'static str) {
    counter!("call_leaves_total", "reason" => reason).increment(1);
}

/// Record a renegotiation after the counterpart left.
///
/// Metric: `call_renegotiations_total`
/// Labels: `role` (offerer, answerer, none), `outcome` (success, error)
///
/// Cardinality: 6
pub fn record_renegotiation(role: &'static str, outcome: &'static str) {
    counter!("call_renegotiations_total", "role" => role, "outcome" => outcome).increment(1);
}

/// Record a published or applied connectivity candidate.
///
/// Metric: `call_candidates_total`
/// Labels: `direction` (local, remote), `outcome` (published, applied,
/// queued, duplicate, error)
pub fn record_candidate(direction: &'static str, outcome: &'static str) {
    counter!(
        "call_candidates_total",
        "direction" => direction,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record the time from join to the first connected notification.
///
/// Metric: `call_negotiation_duration_seconds`
/// Labels: `role`
pub fn record_negotiation_duration(role: &'static str, duration: Duration) {
    histogram!("call_negotiation_duration_seconds", "role" => role)
        .record(duration.as_secs_f64());
}

/// Record a device toggle.
///
/// Metric: `call_device_toggles_total`
/// Labels: `kind` (audio, video), `outcome` (enabled, disabled, error)
///
/// Cardinality: 6
pub fn record_device_toggle(kind: &'static str, outcome: &'static str) {
    counter!("call_device_toggles_total", "kind" => kind, "outcome" => outcome).increment(1);
}

/// Record a failed signaling write that did not abort the session.
///
/// Metric: `call_signaling_errors_total`
/// Labels: `operation` (candidate, presence, purge, withdraw, reclaim)
pub fn record_signaling_error(operation: &'static str) {
    counter!("call_signaling_errors_total", "operation" => operation).increment(1);
}
