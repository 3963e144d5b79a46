//! Shared call-session document model.
//!
//! # Document layout
//!
//! ```text
//! channel/{channelId}/call/{fixedId}                 CallSession
//! channel/{channelId}/call/{fixedId}/offererCandidates/{seq}   CandidateRecord
//! channel/{channelId}/call/{fixedId}/answererCandidates/{seq}  CandidateRecord
//! channel/{channelId}/call/{fixedId}/participants/{uid}        Participant
//! ```
//!
//! Field names are camelCase on the wire so that every client of the channel,
//! whatever it is written in, reads the same document.

use chrono::{DateTime, Utc};
use common::types::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Human name of the capture device.
    #[must_use]
    pub const fn device_name(&self) -> &'static str {
        match self {
            MediaKind::Audio => "microphone",
            MediaKind::Video => "camera",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation role. Also names the side that owns a candidate log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Offerer => "offerer",
            Role::Answerer => "answerer",
        }
    }

    #[must_use]
    pub const fn opposite(&self) -> Role {
        match self {
            Role::Offerer => Role::Answerer,
            Role::Answerer => Role::Offerer,
        }
    }

    /// Sub-collection holding the candidates published by this side.
    #[must_use]
    pub const fn candidate_log(&self) -> &'static str {
        match self {
            Role::Offerer => "offererCandidates",
            Role::Answerer => "answererCandidates",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A published offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
    /// Publisher.
    pub by: UserId,
    pub at: DateTime<Utc>,
}

impl SessionDescription {
    #[must_use]
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>, by: UserId) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
            by,
            at: Utc::now(),
        }
    }
}

/// The per-channel call session document.
///
/// A session without an `offer` is empty and open to a new offerer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallSession {
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub created_at: Option<DateTime<Utc>>,
}

impl CallSession {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offer.is_none()
    }
}

/// A connectivity candidate as produced by the local connection object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Deduplication key: media-line index plus descriptor string.
    #[must_use]
    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            mline_index: self.sdp_mline_index,
            descriptor: self.candidate.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateKey {
    pub mline_index: Option<u16>,
    pub descriptor: String,
}

/// One entry in a candidate log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    #[serde(flatten)]
    pub candidate: IceCandidate,
    pub side: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Active,
    Left,
    Removed,
}

/// A roster entry, keyed by `uid`.
///
/// Optional fields serialize as `null` rather than being skipped so that a
/// merge of a fresh entry clears `kickedBy`/`removedAt` from an earlier kick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub uid: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub has_audio: bool,
    #[serde(default)]
    pub has_video: bool,
    pub status: ParticipantStatus,
    #[serde(default)]
    pub stream_id: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub kicked_by: Option<UserId>,
    #[serde(default)]
    pub removed_at: Option<DateTime<Utc>>,
}

impl Participant {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }

    /// Initial letter used by placeholder tiles.
    #[must_use]
    pub fn initial(&self) -> char {
        self.display_name
            .chars()
            .find(|c| c.is_alphanumeric())
            .and_then(|c| c.to_uppercase().next())
            .unwrap_or('?')
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn participant(uid: &str) -> Participant {
        let now = Utc::now();
        Participant {
            uid: UserId::new(uid),
            display_name: "alice".to_string(),
            avatar_url: None,
            has_audio: true,
            has_video: false,
            status: ParticipantStatus::Active,
            stream_id: Some("stream-1".to_string()),
            joined_at: now,
            updated_at: now,
            kicked_by: None,
            removed_at: None,
        }
    }

    #[test]
    fn test_participant_wire_format_is_camel_case_with_nulls() {
        let value = serde_json::to_value(participant("alice")).unwrap();

        assert_eq!(value["displayName"], "alice");
        assert_eq!(value["hasAudio"], true);
        assert_eq!(value["status"], "active");
        assert_eq!(value["streamId"], "stream-1");
        assert!(value.get("kickedBy").unwrap().is_null());
        assert!(value.get("removedAt").unwrap().is_null());
    }

    #[test]
    fn test_candidate_record_flattens_candidate_fields() {
        let record = CandidateRecord {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            side: Role::Answerer,
            created_at: Utc::now(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["sdpMLineIndex"], 0);
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["side"], "answerer");

        let back: CandidateRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_call_session_tolerates_missing_fields() {
        let session: CallSession = serde_json::from_value(json!({
            "offer": {"type": "offer", "sdp": "v=0", "by": "alice", "at": "2024-05-01T10:00:00Z"}
        }))
        .unwrap();

        assert!(!session.is_empty());
        assert!(session.answer.is_none());
        assert_eq!(session.offer.unwrap().sdp_type, SdpType::Offer);
        assert!(CallSession::default().is_empty());
    }

    #[test]
    fn test_candidate_key_ignores_mid_and_ufrag() {
        let a = IceCandidate {
            candidate: "candidate:abc".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(1),
            username_fragment: Some("u1".to_string()),
        };
        let b = IceCandidate {
            sdp_mid: None,
            username_fragment: None,
            ..a.clone()
        };
        assert_eq!(a.key(), b.key());

        let c = IceCandidate {
            sdp_mline_index: Some(0),
            ..a.clone()
        };
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_role_candidate_logs() {
        assert_eq!(Role::Offerer.candidate_log(), "offererCandidates");
        assert_eq!(Role::Offerer.opposite().candidate_log(), "answererCandidates");
    }

    #[test]
    fn test_initial() {
        let mut p = participant("x");
        assert_eq!(p.initial(), 'A');
        p.display_name = "  ".to_string();
        assert_eq!(p.initial(), '?');
    }
}
