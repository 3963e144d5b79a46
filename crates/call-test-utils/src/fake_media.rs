//! Capture devices with scripted failures.

use call_session::errors::MediaError;
use call_session::media::{LocalTrack, MediaBackend};
use call_session::model::MediaKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MediaState {
    failures: HashMap<MediaKind, MediaError>,
    tracks: Vec<LocalTrack>,
    open_calls: HashMap<MediaKind, usize>,
}

/// [`MediaBackend`] that hands out plain [`LocalTrack`]s. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeMediaBackend {
    state: Arc<Mutex<MediaState>>,
}

impl FakeMediaBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later `open` of `kind` fails with `error` until [`Self::heal`].
    pub fn fail(&self, kind: MediaKind, error: MediaError) {
        self.state.lock().unwrap().failures.insert(kind, error);
    }

    pub fn heal(&self, kind: MediaKind) {
        self.state.lock().unwrap().failures.remove(&kind);
    }

    /// Tracks of `kind` that were opened and not yet closed.
    #[must_use]
    pub fn live_tracks(&self, kind: MediaKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .tracks
            .iter()
            .filter(|t| t.kind() == kind && t.is_live())
            .count()
    }

    /// Every track handed out so far, oldest first.
    #[must_use]
    pub fn opened(&self) -> Vec<LocalTrack> {
        self.state.lock().unwrap().tracks.clone()
    }

    /// Number of `open` attempts for `kind`, failed ones included.
    #[must_use]
    pub fn open_calls(&self, kind: MediaKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .open_calls
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl MediaBackend for FakeMediaBackend {
    async fn open(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, MediaError> {
        let mut state = self.state.lock().unwrap();
        *state.open_calls.entry(kind).or_default() += 1;
        if let Some(error) = state.failures.get(&kind) {
            return Err(error.clone());
        }
        let track = LocalTrack::new(kind, stream_id);
        state.tracks.push(track.clone());
        Ok(track)
    }

    fn close(&self, track: &LocalTrack) {
        track.stop();
    }
}
