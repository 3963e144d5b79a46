//! Observability for the call session.
//!
//! Logging goes through `tracing` with one `call.*` target per component.
//! Metrics are emitted through the `metrics` facade; the client binary
//! installs no exporter, so a host application that wants them installs its
//! own recorder before spawning the controller.
//!
//! # Privacy by Default
//!
//! SDP bodies, candidate descriptors and store URLs are never logged or used
//! as metric labels. Labels are bounded enums.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `call_joins_total` | Counter | `role`, `outcome` | Join attempts by outcome |
//! | `call_leaves_total` | Counter | `reason` | Session closes by reason |
//! | `call_renegotiations_total` | Counter | `role`, `outcome` | Resets after the counterpart left |
//! | `call_candidates_total` | Counter | `direction`, `outcome` | Candidate publish/apply |
//! | `call_negotiation_duration_seconds` | Histogram | `role` | Join to first connected |
//! | `call_device_toggles_total` | Counter | `kind`, `outcome` | Device enable/disable |
//! | `call_signaling_errors_total` | Counter | `operation` | Failed signaling writes |

pub mod metrics;

pub use metrics::{
    record_candidate, record_device_toggle, record_join, record_leave,
    record_negotiation_duration, record_renegotiation, record_signaling_error,
};
