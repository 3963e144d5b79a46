//! Call session configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::context::{DEFAULT_MAX_PARTICIPANTS, DEFAULT_NEGOTIATION_TIMEOUT};
use crate::model::MediaKind;
use crate::peer::DEFAULT_STUN_URLS;
use crate::signaling::DEFAULT_SESSION_DOC_ID;
use common::observability::ObservabilityConfig;
use common::secret::SecretString;
use common::types::{ChannelId, UserId};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Call session configuration.
#[derive(Clone)]
pub struct Config {
    /// Identity of this client.
    pub user_id: UserId,

    /// Roster display name (default: the user id).
    pub display_name: String,

    pub avatar_url: Option<String>,

    /// Document store URL. `None` runs against the in-process store.
    /// Protected by `SecretString` since it may carry credentials.
    pub redis_url: Option<SecretString>,

    /// Fixed id of the session document under each channel.
    pub session_doc_id: String,

    /// STUN servers. No TURN relay is supported.
    pub stun_urls: Vec<String>,

    /// Bound on the `Negotiating` state (default: 30s).
    pub negotiation_timeout: Duration,

    pub supports_kick: bool,

    pub max_participants: usize,

    /// Users granted manage permission on every channel.
    pub managers: Vec<UserId>,

    /// Capture devices present on this host.
    pub media_devices: Vec<MediaKind>,

    pub start_audio: bool,

    pub start_video: bool,

    /// Channel joined on start-up, if any.
    pub channel_id: Option<ChannelId>,

    /// JSON file holding local volume preferences.
    pub prefs_path: Option<PathBuf>,

    /// Emit logs as JSON.
    pub log_json: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("user_id", &self.user_id)
            .field("display_name", &self.display_name)
            .field("avatar_url", &self.avatar_url)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("session_doc_id", &self.session_doc_id)
            .field("stun_urls", &self.stun_urls)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("supports_kick", &self.supports_kick)
            .field("max_participants", &self.max_participants)
            .field("managers", &self.managers)
            .field("media_devices", &self.media_devices)
            .field("start_audio", &self.start_audio)
            .field("start_video", &self.start_video)
            .field("channel_id", &self.channel_id)
            .field("prefs_path", &self.prefs_path)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_bool(vars: &HashMap<String, String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match vars.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue(format!("{key}={v}"))),
    }
}

/// Comma separated list with empty items dropped.
fn parse_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_media_kind(value: &str) -> Result<MediaKind, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "audio" => Ok(MediaKind::Audio),
        "video" => Ok(MediaKind::Video),
        other => Err(ConfigError::InvalidValue(format!(
            "CALL_MEDIA_DEVICES contains unknown kind '{other}'"
        ))),
    }
}

/// Log filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "call_session=debug";

impl Config {
    /// Log output settings for this configuration.
    #[must_use]
    pub fn observability(&self) -> ObservabilityConfig {
        ObservabilityConfig::new(DEFAULT_LOG_FILTER, self.log_json)
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value
    /// does not parse.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let user_id = vars
            .get("CALL_USER_ID")
            .filter(|v| !v.trim().is_empty())
            .map(|v| UserId::new(v.trim()))
            .ok_or_else(|| ConfigError::MissingEnvVar("CALL_USER_ID".to_string()))?;

        let display_name = vars
            .get("CALL_DISPLAY_NAME")
            .cloned()
            .unwrap_or_else(|| user_id.to_string());

        let avatar_url = vars.get("CALL_AVATAR_URL").cloned();

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|v| !v.is_empty())
            .map(|v| SecretString::from(v.clone()));

        let session_doc_id = vars
            .get("CALL_SESSION_DOC_ID")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SESSION_DOC_ID.to_string());

        let stun_urls: Vec<String> = match vars.get("CALL_STUN_URLS") {
            Some(value) => parse_list(value).map(ToString::to_string).collect(),
            None => DEFAULT_STUN_URLS.iter().map(ToString::to_string).collect(),
        };
        if let Some(url) = stun_urls.iter().find(|u| !u.starts_with("stun:")) {
            return Err(ConfigError::InvalidValue(format!(
                "CALL_STUN_URLS only accepts stun: URLs, got '{url}'"
            )));
        }

        let negotiation_timeout = match vars.get("CALL_NEGOTIATION_TIMEOUT_SECONDS") {
            Some(value) => {
                let secs: u64 = value.parse().map_err(|e| {
                    ConfigError::InvalidValue(format!("CALL_NEGOTIATION_TIMEOUT_SECONDS: {e}"))
                })?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue(
                        "CALL_NEGOTIATION_TIMEOUT_SECONDS must be positive".to_string(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_NEGOTIATION_TIMEOUT,
        };

        let supports_kick = parse_bool(vars, "CALL_SUPPORTS_KICK", true)?;

        let max_participants = match vars.get("CALL_MAX_PARTICIPANTS") {
            Some(value) => {
                let max: usize = value.parse().map_err(|e| {
                    ConfigError::InvalidValue(format!("CALL_MAX_PARTICIPANTS: {e}"))
                })?;
                // One offer/answer pair connects exactly two peers.
                if !(1..=DEFAULT_MAX_PARTICIPANTS).contains(&max) {
                    return Err(ConfigError::InvalidValue(format!(
                        "CALL_MAX_PARTICIPANTS must be 1..={DEFAULT_MAX_PARTICIPANTS}, got {max}"
                    )));
                }
                max
            }
            None => DEFAULT_MAX_PARTICIPANTS,
        };

        let managers = vars
            .get("CALL_MANAGERS")
            .map(|v| parse_list(v).map(UserId::new).collect())
            .unwrap_or_default();

        let media_devices = match vars.get("CALL_MEDIA_DEVICES") {
            Some(value) => parse_list(value)
                .map(parse_media_kind)
                .collect::<Result<Vec<_>, _>>()?,
            None => MediaKind::ALL.to_vec(),
        };

        let start_audio = parse_bool(vars, "CALL_START_AUDIO", true)?;
        let start_video = parse_bool(vars, "CALL_START_VIDEO", false)?;

        let channel_id = vars
            .get("CALL_CHANNEL_ID")
            .filter(|v| !v.trim().is_empty())
            .map(|v| ChannelId::new(v.trim()));

        let prefs_path = vars.get("CALL_PREFS_PATH").map(PathBuf::from);

        let log_json = parse_bool(vars, "CALL_LOG_JSON", false)?;

        Ok(Config {
            user_id,
            display_name,
            avatar_url,
            redis_url,
            session_doc_id,
            stun_urls,
            negotiation_timeout,
            supports_kick,
            max_participants,
            managers,
            media_devices,
            start_audio,
            start_video,
            channel_id,
            prefs_path,
            log_json,
        })
    }
}
