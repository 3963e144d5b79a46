//! Peer connection abstraction.
//!
//! The negotiator drives a connection object through [`PeerConnection`] and
//! receives its asynchronous callbacks as [`PeerEvent`]s on a channel.
//! [`RtcPeerFactory`] is the webrtc-rs implementation.
//!
//! Every connection is created with exactly two send/receive transceivers,
//! audio first, then video. Tracks are swapped on those transceivers with
//! [`PeerConnection::replace_track`], which never requires renegotiation.

mod rtc;

pub use rtc::RtcPeerFactory;

use crate::errors::PeerError;
use crate::media::LocalTrack;
use crate::model::{IceCandidate, MediaKind, SdpType};
use tokio::sync::mpsc;

/// Default public STUN servers. No TURN relay is configured.
pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Connection-level state reported by the connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// An inbound track observed on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local connectivity candidate was gathered.
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(RemoteTrackInfo),
}

/// Fixed ICE configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: DEFAULT_STUN_URLS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Everything needed to build one connection object.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice: IceConfig,
    /// Stream id shared by the local tracks.
    pub stream_id: String,
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// One offer/answer/ICE connection object.
#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, PeerError>;

    async fn create_answer(&self) -> Result<String, PeerError>;

    async fn set_local_description(&self, sdp_type: SdpType, sdp: &str) -> Result<(), PeerError>;

    async fn set_remote_description(&self, sdp_type: SdpType, sdp: &str)
        -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Swap the outgoing track on the `kind` transceiver. `None` sends
    /// nothing while keeping the transceiver.
    async fn replace_track(
        &self,
        kind: MediaKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Builds connection objects.
#[async_trait::async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerConfig,
    ) -> Result<(Box<dyn PeerConnection>, PeerEvents), PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ice_config_is_stun_only() {
        let ice = IceConfig::default();
        assert_eq!(ice.stun_urls.len(), 2);
        assert!(ice.stun_urls.iter().all(|url| url.starts_with("stun:")));
    }
}
