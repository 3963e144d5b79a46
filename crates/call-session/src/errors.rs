//! Call session error types.
//!
//! Every public async operation returns [`CallError`]. Backend details
//! (store URLs, SDP bodies, driver messages) stay in the `Display` output for
//! logs; [`CallError::client_message`] is what a user interface shows.

use crate::model::MediaKind;
use common::types::UserId;
use thiserror::Error;

/// Call session error type.
#[derive(Debug, Error)]
pub enum CallError {
    /// Local device could not be acquired.
    #[error("Media error ({kind}): {source}")]
    Media {
        kind: MediaKind,
        #[source]
        source: MediaError,
    },

    /// Document store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Peer connection operation failed.
    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    /// The session already holds the maximum number of participants.
    #[error("Call session is full")]
    SessionFull,

    /// A join was requested while already joined.
    #[error("Already joined")]
    AlreadyJoined,

    /// An in-session operation was requested while not joined.
    #[error("Not joined to a call")]
    NotJoined,

    /// This client was removed by a moderator.
    #[error("Removed from call by {by}")]
    RemovedBy { by: UserId },

    /// The call session document was deleted or replaced remotely.
    #[error("Call session ended")]
    SessionEnded,

    /// Negotiation did not reach a connected state in time.
    #[error("Negotiation timed out")]
    NegotiationTimeout,

    /// The caller lacks permission for the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The session is configured without kick support.
    #[error("Kick is not supported for this call")]
    KickUnsupported,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The component has already shut down.
    #[error("Call component closed")]
    Closed,

    /// Internal error (channel failures, invariant breaks).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Media device acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("device not found")]
    NotFound,

    #[error("device busy")]
    DeviceBusy,

    #[error("{0}")]
    Other(String),
}

impl MediaError {
    /// User-facing reason string for a failed acquisition of `kind`.
    #[must_use]
    pub fn user_message(&self, kind: MediaKind) -> String {
        let device = kind.device_name();
        match self {
            MediaError::PermissionDenied => {
                format!("Permission to use the {device} was denied")
            }
            MediaError::NotFound => format!("No {device} was found"),
            MediaError::DeviceBusy => {
                format!("The {device} is being used by another application")
            }
            MediaError::Other(_) => format!("The {device} could not be started"),
        }
    }
}

/// Document store failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Store-side authorization rejected the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend unreachable or returned an unexpected reply.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StoreError::PermissionDenied(_))
    }

    /// Whether retrying the same write can never succeed.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            StoreError::PermissionDenied(_) | StoreError::NotFound(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Peer connection failures.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("session description error: {0}")]
    Sdp(String),

    #[error("ICE error: {0}")]
    Ice(String),

    #[error("track error: {0}")]
    Track(String),

    #[error("peer connection closed")]
    Closed,

    #[error("peer backend error: {0}")]
    Backend(String),
}

impl CallError {
    /// Wrap a media failure for `kind`.
    #[must_use]
    pub fn media(kind: MediaKind, source: MediaError) -> Self {
        CallError::Media { kind, source }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CallError::Media { kind, source } => source.user_message(*kind),
            CallError::Store(_) | CallError::Config(_) | CallError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            CallError::Peer(_) => "Could not connect to the call".to_string(),
            CallError::SessionFull => "This call is full".to_string(),
            CallError::AlreadyJoined => "You are already in this call".to_string(),
            CallError::NotJoined => "You are not in a call".to_string(),
            CallError::RemovedBy { .. } => "You were removed from the call".to_string(),
            CallError::SessionEnded => "The call has ended".to_string(),
            CallError::NegotiationTimeout => "Could not connect to the call".to_string(),
            CallError::PermissionDenied(msg) => msg.clone(),
            CallError::KickUnsupported => {
                "Removing participants is not available in this call".to_string()
            }
            CallError::Closed => "The call is no longer active".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_hide_internal_details() {
        let store_err = CallError::Store(StoreError::Unavailable(
            "connection refused at 192.168.1.100:6379".to_string(),
        ));
        assert!(!store_err.client_message().contains("192.168"));
        assert_eq!(store_err.client_message(), "An internal error occurred");

        let peer_err = CallError::Peer(PeerError::Sdp("v=0\r\no=- 4611 2 IN IP4".to_string()));
        assert!(!peer_err.client_message().contains("v=0"));
    }

    #[test]
    fn test_media_user_messages_are_device_specific() {
        assert_eq!(
            MediaError::PermissionDenied.user_message(MediaKind::Audio),
            "Permission to use the microphone was denied"
        );
        assert_eq!(
            MediaError::NotFound.user_message(MediaKind::Video),
            "No camera was found"
        );
        assert_eq!(
            MediaError::DeviceBusy.user_message(MediaKind::Video),
            "The camera is being used by another application"
        );

        let err = CallError::media(MediaKind::Audio, MediaError::Other("ALSA xrun".to_string()));
        assert!(!err.client_message().contains("ALSA"));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::PermissionDenied("participants/bob".to_string()).is_permission_denied());
        assert!(StoreError::PermissionDenied("x".to_string()).is_unrecoverable());
        assert!(!StoreError::Unavailable("timeout".to_string()).is_unrecoverable());
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", CallError::RemovedBy { by: UserId::new("owner") }),
            "Removed from call by owner"
        );
        assert_eq!(
            format!("{}", CallError::Store(StoreError::Conflict("offer".to_string()))),
            "Store error: conflict: offer"
        );
    }
}
