//! Tracing initialisation shared by Huddle binaries.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output settings.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Filter used when `RUST_LOG` is not set (e.g. `call_session=debug`).
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json_logs: bool,
}

impl ObservabilityConfig {
    #[must_use]
    pub fn new(default_filter: impl Into<String>, json_logs: bool) -> Self {
        Self {
            default_filter: default_filter.into(),
            json_logs,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| self.default_filter.as_str().into())
    }
}

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns `ObservabilityError::SubscriberInit` if a global subscriber is
/// already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    let registry = tracing_subscriber::registry().with(config.env_filter());

    let result = if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| ObservabilityError::SubscriberInit(e.to_string()))
}
