//! Local media devices.
//!
//! [`MediaDeviceManager`] owns the live local tracks of one call session.
//! Capture itself belongs to the host environment behind [`MediaBackend`];
//! the manager enforces the track lifecycle:
//!
//! - acquiring a kind that already has a live track opens the new track
//!   before stopping the old one, so a failed re-acquire keeps the previous
//!   track and toggling never accumulates tracks
//! - `set_enabled` flips the transmission flag only and never touches the
//!   peer connection
//! - a failed acquisition reports a user-facing reason and leaves the
//!   enabled flags as they were

use crate::errors::MediaError;
use crate::model::MediaKind;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// A local capture track.
///
/// Clones share the enabled/live flags and the underlying RTP track.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    id: String,
    stream_id: String,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    rtp: Arc<TrackLocalStaticSample>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 1,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

impl LocalTrack {
    /// Create a live, enabled track belonging to `stream_id`.
    #[must_use]
    pub fn new(kind: MediaKind, stream_id: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        let id = format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            id.clone(),
            stream_id.clone(),
        ));

        Self {
            kind,
            id,
            stream_id,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
            rtp,
        }
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Whether this track is currently transmitting.
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.is_live() && self.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Stop capture. A stopped track never becomes live again.
    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// RTP track handed to the peer connection.
    #[must_use]
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    /// Push one encoded frame from the host capture pipeline. Frames written
    /// while the track is disabled or stopped are dropped.
    ///
    /// # Errors
    ///
    /// Returns `MediaError::Other` if the RTP track rejects the sample.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if !self.is_sending() {
            return Ok(());
        }
        self.rtp
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| MediaError::Other(e.to_string()))
    }
}

/// Host capture environment.
#[async_trait::async_trait]
pub trait MediaBackend: Send + Sync {
    /// Open a capture device of `kind` for `stream_id`.
    async fn open(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, MediaError>;

    /// Release the device behind `track`.
    fn close(&self, track: &LocalTrack);
}

/// Media backend for hosts that push encoded samples into
/// [`LocalTrack::write_sample`].
///
/// Devices listed at construction are available. A device is held by the
/// stream that opened it; opening it for another stream reports
/// `DeviceBusy` until every track of the holder is closed.
pub struct RtcMediaBackend {
    available: HashSet<MediaKind>,
    /// Holder stream and open track count per device.
    open: Mutex<HashMap<MediaKind, (String, usize)>>,
}

impl RtcMediaBackend {
    #[must_use]
    pub fn new(available: impl IntoIterator<Item = MediaKind>) -> Self {
        Self {
            available: available.into_iter().collect(),
            open: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl MediaBackend for RtcMediaBackend {
    async fn open(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, MediaError> {
        if !self.available.contains(&kind) {
            return Err(MediaError::NotFound);
        }

        let mut open = self
            .open
            .lock()
            .map_err(|_| MediaError::Other("device table poisoned".to_string()))?;
        match open.get_mut(&kind) {
            Some((holder, count)) if holder == stream_id => *count += 1,
            Some(_) => return Err(MediaError::DeviceBusy),
            None => {
                open.insert(kind, (stream_id.to_string(), 1));
            }
        }

        Ok(LocalTrack::new(kind, stream_id))
    }

    fn close(&self, track: &LocalTrack) {
        if !track.is_live() {
            return;
        }
        track.stop();
        if let Ok(mut open) = self.open.lock() {
            if let Some((_, count)) = open.get_mut(&track.kind()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    open.remove(&track.kind());
                }
            }
        }
    }
}

/// Owns the local tracks of one call session.
pub struct MediaDeviceManager {
    backend: Arc<dyn MediaBackend>,
    stream_id: String,
    tracks: HashMap<MediaKind, LocalTrack>,
}

impl MediaDeviceManager {
    /// Create a manager whose tracks all belong to `stream_id`.
    #[must_use]
    pub fn new(backend: Arc<dyn MediaBackend>, stream_id: impl Into<String>) -> Self {
        Self {
            backend,
            stream_id: stream_id.into(),
            tracks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Acquire a fresh track of `kind`. An existing track is stopped only
    /// once its replacement is open.
    ///
    /// # Errors
    ///
    /// Returns the backend's `MediaError` when the device cannot be opened;
    /// the previous track, if any, stays in place.
    pub async fn acquire(&mut self, kind: MediaKind) -> Result<LocalTrack, MediaError> {
        let track = match self.backend.open(kind, &self.stream_id).await {
            Ok(track) => track,
            Err(e) => {
                warn!(
                    target: "call.media",
                    kind = %kind,
                    error = %e,
                    kept_previous = self.tracks.contains_key(&kind),
                    "Local track acquisition failed"
                );
                return Err(e);
            }
        };

        info!(
            target: "call.media",
            kind = %kind,
            track_id = %track.id(),
            "Local track acquired"
        );
        if let Some(old) = self.tracks.insert(kind, track.clone()) {
            debug!(
                target: "call.media",
                kind = %kind,
                track_id = %old.id(),
                "Stopping replaced track"
            );
            self.backend.close(&old);
        }
        Ok(track)
    }

    /// Stop and detach the track of `kind`, if any.
    pub fn release(&mut self, kind: MediaKind) -> Option<LocalTrack> {
        let track = self.tracks.remove(&kind)?;
        self.backend.close(&track);
        debug!(target: "call.media", kind = %kind, "Local track released");
        Some(track)
    }

    pub fn release_all(&mut self) {
        for kind in MediaKind::ALL {
            self.release(kind);
        }
    }

    /// Flip the transmission flag of the live track of `kind`.
    ///
    /// Returns `false` when there is no track to flip.
    pub fn set_enabled(&mut self, kind: MediaKind, enabled: bool) -> bool {
        match self.tracks.get(&kind) {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.get(&kind)
    }

    /// Whether `kind` is live and enabled.
    #[must_use]
    pub fn is_sending(&self, kind: MediaKind) -> bool {
        self.tracks.get(&kind).is_some_and(LocalTrack::is_sending)
    }
}

impl Drop for MediaDeviceManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
