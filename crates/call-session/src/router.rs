//! Participant to stream routing.
//!
//! Turns the active roster and the inbound tracks of the connection into one
//! [`RenderTile`] per participant. Self renders the local stream. Others are
//! matched by the `streamId` on their roster entry; a participant that
//! advertises video but whose stream id matched nothing, or matched a stream
//! without video, gets the first unclaimed inbound video stream. That fallback can pick the wrong stream
//! when several unmatched publishers race, so it is reported as
//! [`MatchKind::Fallback`] rather than as a real match. Anything left
//! renders a placeholder.

use crate::model::{MediaKind, Participant};
use crate::peer::RemoteTrackInfo;
use crate::prefs::{PreferenceStore, VolumePreference};
use common::types::UserId;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileMedia {
    Local { stream_id: String },
    Remote { stream_id: String },
    /// Avatar initial shown instead of video.
    Placeholder { initial: char },
}

/// How a tile's media was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    SelfStream,
    StreamId,
    Fallback,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderTile {
    pub uid: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_self: bool,
    pub has_audio: bool,
    pub has_video: bool,
    pub media: TileMedia,
    pub matched: MatchKind,
    /// Local playback preference; `None` for self.
    pub volume: Option<VolumePreference>,
}

/// One inbound stream, possibly carrying both kinds.
struct InboundStream<'a> {
    stream_id: &'a str,
    has_video: bool,
}

fn group_streams(inbound: &[RemoteTrackInfo]) -> Vec<InboundStream<'_>> {
    let mut streams: Vec<InboundStream<'_>> = Vec::new();
    for track in inbound {
        let is_video = track.kind == MediaKind::Video;
        match streams.iter_mut().find(|s| s.stream_id == track.stream_id) {
            Some(stream) => stream.has_video |= is_video,
            None => streams.push(InboundStream {
                stream_id: &track.stream_id,
                has_video: is_video,
            }),
        }
    }
    streams
}

/// Build the tiles for `roster`, self first, others in roster order.
///
/// Inactive roster entries are skipped.
#[must_use]
pub fn route(
    self_uid: &UserId,
    local_stream_id: Option<&str>,
    roster: &[Participant],
    inbound: &[RemoteTrackInfo],
    prefs: &PreferenceStore,
) -> Vec<RenderTile> {
    let streams = group_streams(inbound);
    let mut claimed: HashSet<&str> = HashSet::new();

    let active: Vec<&Participant> = roster.iter().filter(|p| p.is_active()).collect();
    let others: Vec<&Participant> = active
        .iter()
        .copied()
        .filter(|p| p.uid != *self_uid)
        .collect();

    // Exact matches first so that the fallback never takes a stream that
    // belongs to someone else on the roster.
    let exact: Vec<Option<&InboundStream<'_>>> = others
        .iter()
        .map(|p| {
            let wanted = p.stream_id.as_deref()?;
            let stream = streams.iter().find(|s| s.stream_id == wanted)?;
            claimed.insert(stream.stream_id);
            Some(stream)
        })
        .collect();

    let mut media: Vec<Option<(TileMedia, MatchKind)>> = Vec::with_capacity(others.len());
    for (participant, matched) in others.iter().zip(exact) {
        let slot = matched.map(|stream| {
            (
                TileMedia::Remote {
                    stream_id: stream.stream_id.to_string(),
                },
                MatchKind::StreamId,
            )
        });
        // An audio-only match still leaves the video to find.
        let wants_video = participant.has_video && !matched.is_some_and(|s| s.has_video);
        media.push(if wants_video {
            fallback_video(participant, &streams, &mut claimed).or(slot)
        } else {
            slot
        });
    }

    let mut tiles = Vec::with_capacity(active.len());
    if let Some(own) = active.iter().find(|p| p.uid == *self_uid) {
        let (media, matched) = match local_stream_id {
            Some(stream_id) => (
                TileMedia::Local {
                    stream_id: stream_id.to_string(),
                },
                MatchKind::SelfStream,
            ),
            None => (
                TileMedia::Placeholder {
                    initial: own.initial(),
                },
                MatchKind::None,
            ),
        };
        tiles.push(tile(own, true, media, matched, None));
    }

    for (participant, slot) in others.into_iter().zip(media) {
        let (media, matched) = slot.unwrap_or_else(|| {
            (
                TileMedia::Placeholder {
                    initial: participant.initial(),
                },
                MatchKind::None,
            )
        });
        let volume = Some(prefs.get(self_uid, &participant.uid));
        tiles.push(tile(participant, false, media, matched, volume));
    }

    tiles
}

/// First unclaimed inbound stream carrying video, claimed for `participant`.
fn fallback_video<'a>(
    participant: &Participant,
    streams: &[InboundStream<'a>],
    claimed: &mut HashSet<&'a str>,
) -> Option<(TileMedia, MatchKind)> {
    let stream = streams
        .iter()
        .find(|s| s.has_video && !claimed.contains(s.stream_id))?;
    claimed.insert(stream.stream_id);
    debug!(
        target: "call.router",
        uid = %participant.uid,
        stream_id = %stream.stream_id,
        "Video stream assigned by fallback"
    );
    Some((
        TileMedia::Remote {
            stream_id: stream.stream_id.to_string(),
        },
        MatchKind::Fallback,
    ))
}

fn tile(
    participant: &Participant,
    is_self: bool,
    media: TileMedia,
    matched: MatchKind,
    volume: Option<VolumePreference>,
) -> RenderTile {
    RenderTile {
        uid: participant.uid.clone(),
        display_name: participant.display_name.clone(),
        avatar_url: participant.avatar_url.clone(),
        is_self,
        has_audio: participant.has_audio,
        has_video: participant.has_video,
        media,
        matched,
        volume,
    }
}
