//! Message and view types for the call actors.
//!
//! All communication with an actor goes through its handle: requests are
//! `mpsc` messages carrying a `oneshot` reply channel, and state is observed
//! through a `watch` channel holding the latest [`SessionView`].

use crate::errors::CallError;
use crate::model::{MediaKind, Participant, Role};
use crate::peer::RemoteTrackInfo;
use crate::prefs::VolumePreference;
use crate::router::RenderTile;
use common::types::{ChannelId, UserId};
use tokio::sync::oneshot;

/// Negotiator lifecycle.
///
/// `Closed` and `Failed` are terminal: the actor exits after reaching them.
/// A failed join rolls back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Idle,
    AcquiringMedia,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl NegotiatorState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, NegotiatorState::Closed | NegotiatorState::Failed)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NegotiatorState::Idle => "idle",
            NegotiatorState::AcquiringMedia => "acquiring_media",
            NegotiatorState::Negotiating => "negotiating",
            NegotiatorState::Connected => "connected",
            NegotiatorState::Disconnected => "disconnected",
            NegotiatorState::Closed => "closed",
            NegotiatorState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NegotiatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a joined session was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit `leave()`.
    Left,
    RemovedBy(UserId),
    /// The session document was deleted or its offer replaced.
    SessionEnded,
    NegotiationTimeout,
    ConnectionFailed,
    /// A signaling write could never succeed or a feed stopped.
    SignalingFailure,
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Left => "left",
            CloseReason::RemovedBy(_) => "removed",
            CloseReason::SessionEnded => "session_ended",
            CloseReason::NegotiationTimeout => "negotiation_timeout",
            CloseReason::ConnectionFailed => "connection_failed",
            CloseReason::SignalingFailure => "signaling_failure",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// State the negotiator ends in.
    #[must_use]
    pub const fn terminal_state(&self) -> NegotiatorState {
        match self {
            CloseReason::NegotiationTimeout | CloseReason::ConnectionFailed => {
                NegotiatorState::Failed
            }
            _ => NegotiatorState::Closed,
        }
    }

    /// User-facing status posted when closing for this reason.
    #[must_use]
    pub fn status(&self) -> StatusMessage {
        match self {
            CloseReason::Left | CloseReason::Shutdown => {
                StatusMessage::new(StatusKind::Left, "You left the call")
            }
            CloseReason::RemovedBy(by) => StatusMessage::new(
                StatusKind::Removed,
                format!("You were removed from the call by {by}"),
            ),
            CloseReason::SessionEnded => StatusMessage::new(StatusKind::Ended, "The call has ended"),
            CloseReason::NegotiationTimeout => {
                StatusMessage::new(StatusKind::Failed, "Could not connect to the call")
            }
            CloseReason::ConnectionFailed => {
                StatusMessage::new(StatusKind::Failed, "The connection to the call was lost")
            }
            CloseReason::SignalingFailure => {
                StatusMessage::new(StatusKind::Failed, "Lost contact with the call service")
            }
        }
    }
}

/// Category of a user-facing status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// Non-fatal notice, such as a device that could not be started.
    Info,
    Left,
    Ended,
    Failed,
    /// Removal by a moderator outranks everything else.
    Removed,
}

impl StatusKind {
    const fn priority(self) -> u8 {
        match self {
            StatusKind::Info => 0,
            StatusKind::Left => 1,
            StatusKind::Ended | StatusKind::Failed => 2,
            StatusKind::Removed => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub kind: StatusKind,
    pub text: String,
}

impl StatusMessage {
    #[must_use]
    pub fn new(kind: StatusKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Whether this message may replace `current`.
    #[must_use]
    pub fn overrides(&self, current: Option<&StatusMessage>) -> bool {
        current.map_or(true, |current| {
            self.kind.priority() >= current.kind.priority()
        })
    }
}

/// Which devices the user wants on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesiredMedia {
    pub audio: bool,
    pub video: bool,
}

impl DesiredMedia {
    #[must_use]
    pub const fn get(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    pub fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio = enabled,
            MediaKind::Video => self.video = enabled,
        }
    }
}

impl Default for DesiredMedia {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// Local media as seen by the user interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMediaView {
    pub stream_id: Option<String>,
    /// Actually transmitting.
    pub audio: bool,
    pub video: bool,
}

/// Snapshot of one negotiator, published after every handled message or
/// event. A reply is only sent once the view reflects it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub channel_id: ChannelId,
    pub state: NegotiatorState,
    pub role: Option<Role>,
    /// Active roster entries, self included.
    pub roster: Vec<Participant>,
    pub inbound: Vec<RemoteTrackInfo>,
    pub local: LocalMediaView,
    pub desired: DesiredMedia,
    pub status: Option<StatusMessage>,
}

impl SessionView {
    #[must_use]
    pub fn new(channel_id: ChannelId, desired: DesiredMedia) -> Self {
        Self {
            channel_id,
            state: NegotiatorState::Idle,
            role: None,
            roster: Vec::new(),
            inbound: Vec::new(),
            local: LocalMediaView::default(),
            desired,
            status: None,
        }
    }
}

/// Messages sent to the `SessionNegotiator` actor.
#[derive(Debug)]
pub enum NegotiatorMessage {
    /// Run the join transition.
    Join {
        respond_to: oneshot::Sender<Result<Role, CallError>>,
    },

    /// Close the session (explicit leave).
    Leave {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    SetDeviceEnabled {
        kind: MediaKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
}

/// The session the user wants to be in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredSession {
    pub channel_id: ChannelId,
    /// Roster display name for this session.
    pub display_name: String,
    /// Whether the call panel is shown; does not affect the connection.
    pub visible: bool,
}

impl DesiredSession {
    #[must_use]
    pub fn new(channel_id: ChannelId, display_name: impl Into<String>) -> Self {
        Self {
            channel_id,
            display_name: display_name.into(),
            visible: true,
        }
    }
}

/// Controller state for the user interface.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub desired: Option<DesiredSession>,
    pub media: DesiredMedia,
    pub session: Option<SessionView>,
    /// Latest status message, kept after the session that produced it is
    /// gone.
    pub status: Option<StatusMessage>,
    pub tiles: Vec<RenderTile>,
}

/// Messages sent to the `SessionController` actor.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Switch to `desired` (`None` leaves). Replies once the transition has
    /// fully completed.
    SetDesired {
        desired: Option<DesiredSession>,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    SetVisible {
        visible: bool,
        respond_to: oneshot::Sender<()>,
    },

    SetDeviceEnabled {
        kind: MediaKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Remove another participant from the current channel's call.
    Kick {
        target: UserId,
        respond_to: oneshot::Sender<Result<bool, CallError>>,
    },

    SetVolume {
        remote: UserId,
        preference: VolumePreference,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Leave any session and stop the controller.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
}
