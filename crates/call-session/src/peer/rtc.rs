//! webrtc-rs peer connections.

use super::{
    PeerConfig, PeerConnection, PeerEvent, PeerEvents, PeerFactory, PeerState, RemoteTrackInfo,
};
use crate::errors::PeerError;
use crate::media::LocalTrack;
use crate::model::{IceCandidate, MediaKind, SdpType};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds webrtc-rs connections sharing one API instance.
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    /// Create a factory with the default codecs and interceptors.
    ///
    /// # Errors
    ///
    /// Returns `PeerError::Backend` if codec or interceptor registration fails.
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Backend(format!("Failed to register codecs: {e}")))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| PeerError::Backend(format!("Failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self { api })
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

fn map_kind(kind: RTPCodecType) -> Option<MediaKind> {
    match kind {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn rtp_track(track: &LocalTrack) -> Arc<dyn TrackLocal + Send + Sync> {
    track.rtp_track()
}

fn description(sdp_type: SdpType, sdp: &str) -> Result<RTCSessionDescription, PeerError> {
    match sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp.to_string()),
        SdpType::Answer => RTCSessionDescription::answer(sdp.to_string()),
    }
    .map_err(|e| PeerError::Sdp(e.to_string()))
}

fn install_handlers(pc: &RTCPeerConnection, events: &mpsc::UnboundedSender<PeerEvent>) {
    let ice_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = ice_events.clone();
        Box::pin(async move {
            // None marks the end of gathering.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => {
                    warn!(target: "call.peer.rtc", error = %e, "Failed to serialize local candidate");
                }
            }
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            debug!(target: "call.peer.rtc", state = %state, "Peer connection state changed");
            if let Some(state) = map_state(state) {
                let _ = events.send(PeerEvent::StateChanged(state));
            }
        })
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let events = track_events.clone();
        Box::pin(async move {
            let Some(kind) = map_kind(track.kind()) else {
                return;
            };
            let info = RemoteTrackInfo {
                stream_id: track.stream_id(),
                track_id: track.id(),
                kind,
            };
            info!(
                target: "call.peer.rtc",
                kind = %kind,
                stream_id = %info.stream_id,
                "Remote track added"
            );
            let _ = events.send(PeerEvent::RemoteTrack(info));
        })
    }));
}

#[async_trait::async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        config: PeerConfig,
    ) -> Result<(Box<dyn PeerConnection>, PeerEvents), PeerError> {
        let ice_servers = config
            .ice
            .stun_urls
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| PeerError::Backend(format!("Failed to create peer connection: {e}")))?,
        );

        let (sender, receiver) = mpsc::unbounded_channel();
        install_handlers(&pc, &sender);

        let audio = pc
            .add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .map_err(|e| PeerError::Track(format!("Failed to add audio transceiver: {e}")))?;
        let video = pc
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .map_err(|e| PeerError::Track(format!("Failed to add video transceiver: {e}")))?;

        let peer = RtcPeer { pc, audio, video };
        for (kind, track) in [
            (MediaKind::Audio, config.audio.as_ref()),
            (MediaKind::Video, config.video.as_ref()),
        ] {
            if track.is_some() {
                peer.replace_track(kind, track).await?;
            }
        }

        debug!(
            target: "call.peer.rtc",
            stream_id = %config.stream_id,
            "Peer connection created"
        );

        Ok((Box::new(peer), receiver))
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    audio: Arc<RTCRtpTransceiver>,
    video: Arc<RTCRtpTransceiver>,
}

impl RtcPeer {
    fn transceiver(&self, kind: MediaKind) -> &Arc<RTCRtpTransceiver> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}

#[async_trait::async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Sdp(format!("create_offer: {e}")))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Sdp(format!("create_answer: {e}")))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, sdp_type: SdpType, sdp: &str) -> Result<(), PeerError> {
        self.pc
            .set_local_description(description(sdp_type, sdp)?)
            .await
            .map_err(|e| PeerError::Sdp(format!("set_local_description: {e}")))
    }

    async fn set_remote_description(
        &self,
        sdp_type: SdpType,
        sdp: &str,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(description(sdp_type, sdp)?)
            .await
            .map_err(|e| PeerError::Sdp(format!("set_remote_description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::Ice(e.to_string()))
    }

    async fn replace_track(
        &self,
        kind: MediaKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), PeerError> {
        self.transceiver(kind)
            .sender()
            .await
            .replace_track(track.map(rtp_track))
            .await
            .map_err(|e| PeerError::Track(format!("replace_track({kind}): {e}")))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Backend(format!("close: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::peer::IceConfig;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(PeerState::Connected)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(PeerState::Failed)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn test_malformed_sdp_is_rejected() {
        let err = description(SdpType::Answer, "not sdp").unwrap_err();
        assert!(matches!(err, PeerError::Sdp(_)));
    }

    #[tokio::test]
    async fn test_created_offer_carries_both_media_sections() {
        let factory = RtcPeerFactory::new().unwrap();
        let (peer, _events) = factory
            .create(PeerConfig {
                ice: IceConfig { stun_urls: vec![] },
                stream_id: "stream-a".to_string(),
                audio: Some(LocalTrack::new(MediaKind::Audio, "stream-a")),
                video: None,
            })
            .await
            .unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("m=video"));

        peer.close().await.unwrap();
    }
}
