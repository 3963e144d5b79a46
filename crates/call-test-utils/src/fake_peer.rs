//! Scripted peer connections.
//!
//! A [`FakePeer`] behaves like an offer/answer/ICE connection object without
//! any networking:
//!
//! - Session descriptions are plain SDP text carrying one `a=msid` line per
//!   attached local track, so the remote side can report inbound tracks.
//! - Setting the local description gathers a fixed number of host
//!   candidates and emits them as [`PeerEvent::LocalCandidate`].
//! - Once both descriptions are set the connection reports `Connecting`,
//!   then `Connected`, then one [`PeerEvent::RemoteTrack`] per remote msid.
//!   [`FakePeerFactory::without_auto_connect`] disables this for timeout
//!   tests.
//! - Adding a candidate before the remote description fails, like the real
//!   thing.
//!
//! Every created connection is observable through a [`FakePeerTap`].
//!
//! # Example
//!
//! ```rust,ignore
//! use call_test_utils::FakePeerFactory;
//!
//! let peers = FakePeerFactory::new();
//! // ... join through a negotiator built with `peers` ...
//! let tap = peers.last_peer().unwrap();
//! assert!(tap.applied_candidates().len() >= 1);
//! ```

use call_session::errors::PeerError;
use call_session::media::LocalTrack;
use call_session::model::{IceCandidate, MediaKind, SdpType};
use call_session::peer::{
    PeerConfig, PeerConnection, PeerEvent, PeerEvents, PeerFactory, PeerState, RemoteTrackInfo,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Default number of host candidates gathered per connection.
pub const DEFAULT_LOCAL_CANDIDATES: usize = 2;

#[derive(Debug)]
struct FactoryState {
    auto_connect: bool,
    local_candidates: usize,
    fail_next_create: bool,
    created: Vec<FakePeerTap>,
}

/// [`PeerFactory`] producing [`FakePeer`]s. Clones share state.
#[derive(Debug, Clone)]
pub struct FakePeerFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl Default for FakePeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePeerFactory {
    /// Factory whose connections connect as soon as both descriptions are
    /// set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FactoryState {
                auto_connect: true,
                local_candidates: DEFAULT_LOCAL_CANDIDATES,
                fail_next_create: false,
                created: Vec::new(),
            })),
        }
    }

    /// Connections never leave `Connecting` on their own.
    #[must_use]
    pub fn without_auto_connect(self) -> Self {
        self.state.lock().unwrap().auto_connect = false;
        self
    }

    #[must_use]
    pub fn with_local_candidates(self, count: usize) -> Self {
        self.state.lock().unwrap().local_candidates = count;
        self
    }

    /// Make the next `create` call fail.
    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_next_create = true;
    }

    /// Taps of every connection created so far, oldest first.
    #[must_use]
    pub fn peers(&self) -> Vec<FakePeerTap> {
        self.state.lock().unwrap().created.clone()
    }

    #[must_use]
    pub fn last_peer(&self) -> Option<FakePeerTap> {
        self.state.lock().unwrap().created.last().cloned()
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }
}

#[async_trait::async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        config: PeerConfig,
    ) -> Result<(Box<dyn PeerConnection>, PeerEvents), PeerError> {
        let mut factory = self.state.lock().unwrap();
        if std::mem::take(&mut factory.fail_next_create) {
            return Err(PeerError::Backend("scripted create failure".to_string()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let record = PeerRecord {
            stream_id: config.stream_id.clone(),
            stun_urls: config.ice.stun_urls.clone(),
            audio: config.audio.as_ref().map(|t| t.id().to_string()),
            video: config.video.as_ref().map(|t| t.id().to_string()),
            ..PeerRecord::default()
        };
        let tap = FakePeerTap {
            id,
            ordinal: factory.created.len() + 1,
            record: Arc::new(Mutex::new(record)),
            events: events_tx,
        };
        factory.created.push(tap.clone());

        let peer = FakePeer {
            tap,
            auto_connect: factory.auto_connect,
            local_candidates: factory.local_candidates,
        };
        Ok((Box::new(peer), events_rx))
    }
}

#[derive(Debug, Default)]
struct PeerRecord {
    stream_id: String,
    stun_urls: Vec<String>,
    audio: Option<String>,
    video: Option<String>,
    local: Option<(SdpType, String)>,
    remote: Option<(SdpType, String)>,
    applied: Vec<IceCandidate>,
    replaced: Vec<(MediaKind, Option<String>)>,
    connected: bool,
    closed: bool,
}

/// Observation and control handle for one [`FakePeer`].
#[derive(Debug, Clone)]
pub struct FakePeerTap {
    id: String,
    ordinal: usize,
    record: Arc<Mutex<PeerRecord>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl FakePeerTap {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn stream_id(&self) -> String {
        self.record.lock().unwrap().stream_id.clone()
    }

    #[must_use]
    pub fn stun_urls(&self) -> Vec<String> {
        self.record.lock().unwrap().stun_urls.clone()
    }

    #[must_use]
    pub fn local_description(&self) -> Option<(SdpType, String)> {
        self.record.lock().unwrap().local.clone()
    }

    #[must_use]
    pub fn remote_description(&self) -> Option<(SdpType, String)> {
        self.record.lock().unwrap().remote.clone()
    }

    /// Remote candidates applied, in order.
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.record.lock().unwrap().applied.clone()
    }

    /// `replace_track` calls as `(kind, track id)`.
    #[must_use]
    pub fn replaced_tracks(&self) -> Vec<(MediaKind, Option<String>)> {
        self.record.lock().unwrap().replaced.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.record.lock().unwrap().connected
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.record.lock().unwrap().closed
    }

    /// Inject a connection event. Returns `false` once nobody listens.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Report connectivity loss.
    pub fn disconnect(&self) -> bool {
        self.emit(PeerEvent::StateChanged(PeerState::Disconnected))
    }

    /// Report connectivity restored.
    pub fn reconnect(&self) -> bool {
        self.emit(PeerEvent::StateChanged(PeerState::Connected))
    }

    /// Report terminal connection failure.
    pub fn fail(&self) -> bool {
        self.emit(PeerEvent::StateChanged(PeerState::Failed))
    }
}

/// One scripted connection object.
pub struct FakePeer {
    tap: FakePeerTap,
    auto_connect: bool,
    local_candidates: usize,
}

impl FakePeer {
    fn build_sdp(&self, record: &PeerRecord) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.tap.id
        );
        for (kind, track) in [("audio", &record.audio), ("video", &record.video)] {
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\na=sendrecv\r\n"));
            if let Some(track) = track {
                sdp.push_str(&format!("a=msid:{} {track}\r\n", record.stream_id));
            }
        }
        sdp
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.tap.events.send(event);
    }

    fn maybe_connect(&self, record: &mut PeerRecord) {
        if !self.auto_connect || record.connected || record.closed {
            return;
        }
        let Some((_, remote)) = record.remote.clone() else {
            return;
        };
        if record.local.is_none() {
            return;
        }

        record.connected = true;
        self.emit(PeerEvent::StateChanged(PeerState::Connecting));
        self.emit(PeerEvent::StateChanged(PeerState::Connected));
        for track in remote_tracks(&remote) {
            self.emit(PeerEvent::RemoteTrack(track));
        }
    }
}

/// Inbound tracks announced by `sdp`.
#[must_use]
pub fn remote_tracks(sdp: &str) -> Vec<RemoteTrackInfo> {
    let mut kind = None;
    let mut tracks = Vec::new();
    for line in sdp.lines() {
        if line.starts_with("m=audio") {
            kind = Some(MediaKind::Audio);
        } else if line.starts_with("m=video") {
            kind = Some(MediaKind::Video);
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            let mut parts = msid.split_whitespace();
            if let (Some(kind), Some(stream_id), Some(track_id)) = (kind, parts.next(), parts.next())
            {
                tracks.push(RemoteTrackInfo {
                    stream_id: stream_id.to_string(),
                    track_id: track_id.to_string(),
                    kind,
                });
            }
        }
    }
    tracks
}

#[async_trait::async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let record = self.tap.record.lock().unwrap();
        if record.closed {
            return Err(PeerError::Closed);
        }
        Ok(self.build_sdp(&record))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let record = self.tap.record.lock().unwrap();
        if record.closed {
            return Err(PeerError::Closed);
        }
        match &record.remote {
            Some((SdpType::Offer, _)) => Ok(self.build_sdp(&record)),
            _ => Err(PeerError::Sdp("no remote offer to answer".to_string())),
        }
    }

    async fn set_local_description(&self, sdp_type: SdpType, sdp: &str) -> Result<(), PeerError> {
        let mut record = self.tap.record.lock().unwrap();
        if record.closed {
            return Err(PeerError::Closed);
        }
        record.local = Some((sdp_type, sdp.to_string()));

        for n in 0..self.local_candidates {
            self.emit(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{n} 1 udp 2122260223 10.0.0.{} {} typ host",
                    self.tap.ordinal,
                    50000 + n
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: Some(self.tap.id.clone()),
            }));
        }

        self.maybe_connect(&mut record);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        sdp_type: SdpType,
        sdp: &str,
    ) -> Result<(), PeerError> {
        let mut record = self.tap.record.lock().unwrap();
        if record.closed {
            return Err(PeerError::Closed);
        }
        if !sdp.starts_with("v=0") {
            return Err(PeerError::Sdp("malformed session description".to_string()));
        }
        record.remote = Some((sdp_type, sdp.to_string()));
        self.maybe_connect(&mut record);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let mut record = self.tap.record.lock().unwrap();
        if record.closed {
            return Err(PeerError::Closed);
        }
        if record.remote.is_none() {
            return Err(PeerError::Ice("remote description not set".to_string()));
        }
        record.applied.push(candidate.clone());
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: MediaKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), PeerError> {
        let mut record = self.tap.record.lock().unwrap();
        if record.closed {
            return Err(PeerError::Closed);
        }
        let id = track.map(|t| t.id().to_string());
        match kind {
            MediaKind::Audio => record.audio.clone_from(&id),
            MediaKind::Video => record.video.clone_from(&id),
        }
        record.replaced.push((kind, id));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut record = self.tap.record.lock().unwrap();
        if !record.closed {
            record.closed = true;
            record.connected = false;
            self.emit(PeerEvent::StateChanged(PeerState::Closed));
        }
        Ok(())
    }
}
