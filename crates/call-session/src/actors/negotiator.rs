//! `SessionNegotiator` - one peer-to-peer call session per actor.
//!
//! The negotiator owns everything a joined session holds: the connection
//! object, the local tracks, the roster entry and the signaling
//! subscriptions. They live in one [`ActiveSession`] built on join and
//! consumed on close, so nothing outlives the session that created it.
//!
//! # State machine
//!
//! ```text
//! Idle -> AcquiringMedia -> Negotiating -> Connected <-> Disconnected
//!   ^                            |               |
//!   +---- join rolled back ------+               +--> Closed | Failed
//! ```
//!
//! # Role arbitration
//!
//! A joiner that finds no offer creates one and publishes it with an atomic
//! conditional write. Only the winner sets it as local description; a loser
//! answers the winning offer instead. A joiner that finds an offer answers
//! it. The answer is published conditionally as well, and losing that race
//! means the session is full.
//!
//! # Counterpart departure
//!
//! When the other side of the connection leaves the roster, the remaining
//! participant renegotiates: it replaces its connection, clears the offer
//! and answer slots along with both candidate logs, and arbitrates the role
//! again. A joiner that finds the slots still held by someone who is no
//! longer active waits for that reset, and clears the slots itself once the
//! negotiation timeout passes without one.
//!
//! # Events
//!
//! Connection callbacks and change-feed deliveries are forwarded into one
//! channel tagged with the session epoch. Closing bumps the epoch first, so
//! a delivery already in flight for a torn-down session is dropped.

use super::messages::{
    CloseReason, DesiredMedia, LocalMediaView, NegotiatorMessage, NegotiatorState, SessionView,
    StatusKind, StatusMessage,
};
use crate::candidates::{Admission, CandidateLedger};
use crate::context::CallContext;
use crate::errors::CallError;
use crate::media::{LocalTrack, MediaDeviceManager};
use crate::model::{
    CallSession, CandidateRecord, IceCandidate, MediaKind, Participant, Role, SdpType,
    SessionDescription,
};
use crate::observability::{
    record_candidate, record_device_toggle, record_join, record_leave,
    record_negotiation_duration, record_renegotiation, record_signaling_error,
};
use crate::peer::{PeerConfig, PeerConnection, PeerEvent, PeerEvents, PeerState, RemoteTrackInfo};
use crate::presence::{active_roster, PresenceTracker};
use crate::signaling::{AnswerPublish, OfferPublish, SessionChange, SignalingChannel};
use crate::store::ChangeFeed;
use common::types::{ChannelId, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the negotiator mailbox.
const NEGOTIATOR_CHANNEL_BUFFER: usize = 32;

type Tagged = (u64, SessionEvent);

/// Something that happened to the current session.
#[derive(Debug)]
enum SessionEvent {
    Peer(PeerEvent),
    Session(SessionChange),
    RemoteCandidate(CandidateRecord),
    Roster(Vec<Participant>),
    /// A change feed stopped while the session was still open.
    FeedClosed(&'static str),
}

/// What a joiner can do with the session document it found.
#[derive(Debug)]
enum SessionSlot {
    /// No offer yet.
    Open,
    /// An active participant's offer awaits an answer.
    Answerable(SessionDescription),
    /// Offer and answer both belong to active participants.
    Held,
    /// A slot is held by someone no longer on the active roster.
    Stale,
}

impl SessionSlot {
    /// Classify `session` against the uids of the other active participants.
    fn of(session: Option<CallSession>, others: &HashSet<UserId>) -> Self {
        let Some(session) = session else {
            return Self::Open;
        };
        let Some(offer) = session.offer else {
            return Self::Open;
        };
        match session.answer {
            None if others.contains(&offer.by) => Self::Answerable(offer),
            Some(answer) if others.contains(&offer.by) && others.contains(&answer.by) => Self::Held,
            _ => Self::Stale,
        }
    }
}

/// Result of applying a roster delivery.
#[derive(Debug)]
enum RosterOutcome {
    Unchanged,
    Removed(UserId),
    CounterpartLeft(UserId),
}

/// Uids of active roster entries other than `uid`.
fn active_others(roster: &[Participant], uid: &UserId) -> HashSet<UserId> {
    roster
        .iter()
        .filter(|p| p.is_active() && p.uid != *uid)
        .map(|p| p.uid.clone())
        .collect()
}

/// Handle to a `SessionNegotiator`.
#[derive(Clone)]
pub struct NegotiatorHandle {
    sender: mpsc::Sender<NegotiatorMessage>,
    cancel_token: CancellationToken,
    view: watch::Receiver<SessionView>,
}

impl NegotiatorHandle {
    /// Run the join transition. On error the negotiator is back in `Idle`
    /// with nothing left behind.
    ///
    /// # Errors
    ///
    /// Returns the `CallError` that aborted the join.
    pub async fn join(&self) -> Result<Role, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NegotiatorMessage::Join { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Close the session. Leaving a negotiator that already exited is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Currently infallible once delivered; kept fallible for the reply
    /// channel.
    pub async fn leave(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(NegotiatorMessage::Leave { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Turn a local device on or off without renegotiating.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Media` when the device cannot be started; the
    /// device stays in its previous state.
    pub async fn set_device_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NegotiatorMessage::SetDeviceEnabled {
                kind,
                enabled,
                respond_to: tx,
            })
            .await
            .map_err(|_| CallError::Closed)?;

        rx.await.map_err(|_| CallError::Closed)?
    }

    /// Latest published view.
    #[must_use]
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Receiver notified after every change to the view.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Resources of one joined session.
struct ActiveSession {
    role: Role,
    peer: Box<dyn PeerConnection>,
    media: MediaDeviceManager,
    presence: PresenceTracker,
    ledger: CandidateLedger,
    /// The other side of the connection, once known.
    counterpart: Option<UserId>,
    /// Cancels every forwarder task of this session.
    subscriptions: CancellationToken,
    roster: Vec<Participant>,
    inbound: Vec<RemoteTrackInfo>,
    started_at: Instant,
    /// Set while negotiation with a counterpart is under way.
    deadline: Option<Instant>,
}

impl ActiveSession {
    fn sending(&self) -> (bool, bool) {
        (
            self.media.is_sending(MediaKind::Audio),
            self.media.is_sending(MediaKind::Video),
        )
    }

    /// Apply a device toggle by swapping tracks on the existing transceivers.
    async fn apply_device(&mut self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        match (kind, enabled) {
            (_, true) if self.media.is_sending(kind) => Ok(()),
            (MediaKind::Audio, false) => {
                self.media.set_enabled(MediaKind::Audio, false);
                Ok(())
            }
            (MediaKind::Audio, true)
                if self
                    .media
                    .track(MediaKind::Audio)
                    .is_some_and(LocalTrack::is_live) =>
            {
                self.media.set_enabled(MediaKind::Audio, true);
                Ok(())
            }
            (MediaKind::Video, false) => {
                if self.media.release(MediaKind::Video).is_some() {
                    self.peer.replace_track(MediaKind::Video, None).await?;
                }
                Ok(())
            }
            (_, true) => {
                let track = self
                    .media
                    .acquire(kind)
                    .await
                    .map_err(|e| CallError::media(kind, e))?;
                if let Err(e) = self.peer.replace_track(kind, Some(&track)).await {
                    self.media.release(kind);
                    return Err(e.into());
                }
                Ok(())
            }
        }
    }
}

/// The `SessionNegotiator` actor.
pub struct SessionNegotiator {
    ctx: CallContext,
    signaling: SignalingChannel,
    receiver: mpsc::Receiver<NegotiatorMessage>,
    cancel_token: CancellationToken,
    view_tx: watch::Sender<SessionView>,
    events_tx: mpsc::UnboundedSender<Tagged>,
    events_rx: mpsc::UnboundedReceiver<Tagged>,
    /// Bumped on every join, rollback and close.
    epoch: u64,
    state: NegotiatorState,
    desired: DesiredMedia,
    status: Option<StatusMessage>,
    session: Option<ActiveSession>,
}

impl SessionNegotiator {
    /// Spawn a negotiator for `channel_id` in `Idle`.
    #[must_use]
    pub fn spawn(
        ctx: CallContext,
        channel_id: ChannelId,
        desired: DesiredMedia,
        cancel_token: CancellationToken,
    ) -> (NegotiatorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(NEGOTIATOR_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(SessionView::new(channel_id.clone(), desired));

        let actor = Self {
            signaling: ctx.signaling(channel_id),
            ctx,
            receiver,
            cancel_token: cancel_token.clone(),
            view_tx,
            events_tx,
            events_rx,
            epoch: 0,
            state: NegotiatorState::Idle,
            desired,
            status: None,
            session: None,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = NegotiatorHandle {
            sender,
            cancel_token,
            view,
        };

        (handle, task_handle)
    }

    /// Run the actor loop until the session is closed.
    #[instrument(
        skip_all,
        name = "call.actor.negotiator",
        fields(channel_id = %self.signaling.channel_id(), uid = %self.ctx.identity.uid)
    )]
    async fn run(mut self) {
        debug!(
            target: "call.negotiator",
            channel_id = %self.signaling.channel_id(),
            "SessionNegotiator started"
        );

        loop {
            let deadline = self.session.as_ref().and_then(|s| s.deadline);

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "call.negotiator",
                        channel_id = %self.signaling.channel_id(),
                        "SessionNegotiator received cancellation signal"
                    );
                    self.close(CloseReason::Shutdown).await;
                    self.set_state(NegotiatorState::Closed);
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            // Every handle is gone; nobody can leave explicitly.
                            self.close(CloseReason::Shutdown).await;
                            self.set_state(NegotiatorState::Closed);
                        }
                    }
                }

                Some((epoch, event)) = self.events_rx.recv() => {
                    self.handle_event(epoch, event).await;
                }

                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(
                        target: "call.negotiator",
                        channel_id = %self.signaling.channel_id(),
                        timeout_secs = self.ctx.negotiation_timeout.as_secs(),
                        "Negotiation timed out"
                    );
                    self.close(CloseReason::NegotiationTimeout).await;
                }
            }

            self.publish_view();
            if self.state.is_terminal() {
                break;
            }
        }

        info!(
            target: "call.negotiator",
            channel_id = %self.signaling.channel_id(),
            state = %self.state,
            "SessionNegotiator stopped"
        );
    }

    async fn handle_message(&mut self, message: NegotiatorMessage) {
        match message {
            NegotiatorMessage::Join { respond_to } => {
                let result = self.join().await;
                self.publish_view();
                let _ = respond_to.send(result);
            }

            NegotiatorMessage::Leave { respond_to } => {
                if self.session.is_some() {
                    self.close(CloseReason::Left).await;
                } else {
                    self.set_state(NegotiatorState::Closed);
                }
                self.publish_view();
                let _ = respond_to.send(Ok(()));
            }

            NegotiatorMessage::SetDeviceEnabled {
                kind,
                enabled,
                respond_to,
            } => {
                let result = self.set_device_enabled(kind, enabled).await;
                self.publish_view();
                let _ = respond_to.send(result);
            }
        }
    }

    fn set_state(&mut self, state: NegotiatorState) {
        if self.state != state {
            debug!(
                target: "call.negotiator",
                channel_id = %self.signaling.channel_id(),
                from = %self.state,
                to = %state,
                "State transition"
            );
            self.state = state;
            self.publish_view();
        }
    }

    fn post_status(&mut self, status: StatusMessage) {
        if status.overrides(self.status.as_ref()) {
            self.status = Some(status);
        }
    }

    fn publish_view(&self) {
        let session = self.session.as_ref();
        let view = SessionView {
            channel_id: self.signaling.channel_id().clone(),
            state: self.state,
            role: session.map(|s| s.role),
            roster: session.map(|s| s.roster.clone()).unwrap_or_default(),
            inbound: session.map(|s| s.inbound.clone()).unwrap_or_default(),
            local: session.map_or_else(LocalMediaView::default, |s| LocalMediaView {
                stream_id: Some(s.media.stream_id().to_string()),
                audio: s.media.is_sending(MediaKind::Audio),
                video: s.media.is_sending(MediaKind::Video),
            }),
            desired: self.desired,
            status: self.status.clone(),
        };
        self.view_tx.send_replace(view);
    }

    // ------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------

    async fn join(&mut self) -> Result<Role, CallError> {
        if self.session.is_some() {
            return Err(CallError::AlreadyJoined);
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let started_at = Instant::now();
        let stream_id = uuid::Uuid::new_v4().to_string();

        self.set_state(NegotiatorState::AcquiringMedia);
        let mut media = MediaDeviceManager::new(Arc::clone(&self.ctx.media), stream_id.clone());
        for kind in MediaKind::ALL {
            if !self.desired.get(kind) {
                continue;
            }
            // Listen-only for this kind; the join goes on.
            if let Err(e) = media.acquire(kind).await {
                self.post_status(StatusMessage::new(StatusKind::Info, e.user_message(kind)));
            }
        }

        self.set_state(NegotiatorState::Negotiating);
        let created = self
            .ctx
            .peers
            .create(PeerConfig {
                ice: self.ctx.ice.clone(),
                stream_id: stream_id.clone(),
                audio: media.track(MediaKind::Audio).cloned(),
                video: media.track(MediaKind::Video).cloned(),
            })
            .await;
        let (peer, peer_events) = match created {
            Ok(created) => created,
            Err(e) => {
                warn!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    error = %e,
                    "Failed to create peer connection"
                );
                media.release_all();
                self.epoch += 1;
                self.set_state(NegotiatorState::Idle);
                record_join("none", "error");
                return Err(e.into());
            }
        };

        let subscriptions = self.cancel_token.child_token();
        forward_peer_events(peer_events, epoch, subscriptions.clone(), self.events_tx.clone());

        let mut session = ActiveSession {
            // Provisional until arbitration
            role: Role::Offerer,
            peer,
            media,
            presence: PresenceTracker::new(
                self.signaling.clone(),
                self.ctx.identity.clone(),
                stream_id,
            ),
            ledger: CandidateLedger::new(),
            counterpart: None,
            subscriptions,
            roster: Vec::new(),
            inbound: Vec::new(),
            started_at,
            deadline: None,
        };

        match self.negotiate(&mut session, epoch).await {
            Ok(()) => {
                let role = session.role;
                record_join(role.as_str(), "success");
                info!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    role = %role,
                    "Joined call session"
                );
                self.session = Some(session);
                Ok(role)
            }
            Err(e) => {
                let outcome = if matches!(e, CallError::SessionFull) {
                    "full"
                } else {
                    "error"
                };
                record_join("none", outcome);
                warn!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    error = %e,
                    "Join aborted, rolling back"
                );
                self.rollback(session).await;
                Err(e)
            }
        }
    }

    /// Arbitrate the role, exchange descriptions and open subscriptions.
    async fn negotiate(&self, session: &mut ActiveSession, epoch: u64) -> Result<(), CallError> {
        let uid = &self.ctx.identity.uid;
        let roster = self.signaling.read_roster().await?;
        let others = active_others(&roster, uid);
        if others.len() + 1 > self.ctx.capabilities.max_participants {
            return Err(CallError::SessionFull);
        }

        let mut existing = self
            .signaling
            .read_session()
            .await?
            .filter(|session| !session.is_empty());
        // The purge re-reads the roster, so a joiner that raced in since is
        // never purged away.
        if existing.is_some() && others.is_empty() && self.signaling.purge_if_empty().await? {
            info!(
                target: "call.negotiator",
                channel_id = %self.signaling.channel_id(),
                "Reclaimed call session with no active participants"
            );
            existing = None;
        }
        // Checked before presence goes out so a full session never sees this
        // client on its roster.
        if matches!(SessionSlot::of(existing.clone(), &others), SessionSlot::Held) {
            return Err(CallError::SessionFull);
        }

        // Announce presence before any offer exists so that a concurrent
        // joiner never mistakes the new session for a stale one.
        let (has_audio, has_video) = session.sending();
        session.presence.publish(has_audio, has_video).await?;

        let offer_sdp = self.arbitrate(session, existing, others).await?;
        self.subscribe(session, offer_sdp, epoch).await
    }

    /// Take whichever role the session document leaves open and return the
    /// offer SDP negotiated against.
    ///
    /// Slots held by departed participants are waited on until the remaining
    /// participant resets them. After the negotiation timeout they are
    /// cleared here instead, once.
    async fn arbitrate(
        &self,
        session: &mut ActiveSession,
        mut existing: Option<CallSession>,
        mut others: HashSet<UserId>,
    ) -> Result<String, CallError> {
        let mut changes: Option<ChangeFeed<Option<CallSession>>> = None;
        let reclaim_at = Instant::now() + self.ctx.negotiation_timeout;
        let mut reclaimed = false;

        loop {
            match SessionSlot::of(existing.take(), &others) {
                SessionSlot::Open => match self.offer(session).await? {
                    Ok(sdp) => return Ok(sdp),
                    Err(winner) => {
                        existing = Some(winner);
                        continue;
                    }
                },
                SessionSlot::Answerable(offer) => return self.answer(session, offer).await,
                SessionSlot::Held => return Err(CallError::SessionFull),
                SessionSlot::Stale if reclaimed => return Err(CallError::SessionFull),
                SessionSlot::Stale => {}
            }

            if changes.is_none() {
                debug!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    "Session held by a departed participant, waiting for reset"
                );
                changes = Some(self.signaling.watch_session_state().await?);
            }
            let Some(feed) = changes.as_mut() else {
                continue;
            };

            match tokio::time::timeout_at(reclaim_at, feed.next()).await {
                Ok(Some(next)) => existing = next,
                Ok(None) => {
                    return Err(CallError::Internal("session feed closed".to_string()));
                }
                Err(_) => {
                    warn!(
                        target: "call.negotiator",
                        channel_id = %self.signaling.channel_id(),
                        "No reset from the remaining participant, reclaiming session"
                    );
                    self.signaling.reset_session().await.map_err(|e| {
                        record_signaling_error("reclaim");
                        e
                    })?;
                    reclaimed = true;
                    existing = self.signaling.read_session().await?;
                }
            }
            // Authors may have joined since the last read.
            others = active_others(&self.signaling.read_roster().await?, &self.ctx.identity.uid);
        }
    }

    /// Open the session, candidate and roster feeds for `epoch`.
    async fn subscribe(
        &self,
        session: &ActiveSession,
        offer_sdp: String,
        epoch: u64,
    ) -> Result<(), CallError> {
        let token = &session.subscriptions;
        let events = &self.events_tx;
        forward(
            self.signaling.watch_session(offer_sdp).await?,
            SessionEvent::Session,
            "session",
            epoch,
            token.clone(),
            events.clone(),
        );
        forward(
            self.signaling
                .watch_candidates(session.role.opposite())
                .await?,
            SessionEvent::RemoteCandidate,
            "candidates",
            epoch,
            token.clone(),
            events.clone(),
        );
        forward(
            self.signaling.watch_roster().await?,
            SessionEvent::Roster,
            "roster",
            epoch,
            token.clone(),
            events.clone(),
        );

        Ok(())
    }

    /// Try to become offerer. `Ok(Ok(sdp))` when this client's offer was
    /// published, `Ok(Err(session))` when another offer won.
    async fn offer(
        &self,
        session: &mut ActiveSession,
    ) -> Result<Result<String, CallSession>, CallError> {
        let sdp = session.peer.create_offer().await?;
        let offer = SessionDescription::new(SdpType::Offer, sdp.clone(), self.ctx.identity.uid.clone());

        match self.signaling.publish_offer(&offer).await? {
            OfferPublish::Published => {
                session.peer.set_local_description(SdpType::Offer, &sdp).await?;
                session.role = Role::Offerer;
                Ok(Ok(sdp))
            }
            OfferPublish::AlreadyExists(winner) => {
                info!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    "Lost offer race, answering the winning offer"
                );
                Ok(Err(winner))
            }
        }
    }

    /// Answer `offer`; returns the offer SDP negotiated against.
    async fn answer(
        &self,
        session: &mut ActiveSession,
        offer: SessionDescription,
    ) -> Result<String, CallError> {
        session.role = Role::Answerer;
        session.counterpart = Some(offer.by.clone());
        session
            .peer
            .set_remote_description(SdpType::Offer, &offer.sdp)
            .await?;
        // Nothing can be queued yet; this only opens the ledger.
        session.ledger.mark_remote_ready();

        let sdp = session.peer.create_answer().await?;
        session
            .peer
            .set_local_description(SdpType::Answer, &sdp)
            .await?;

        let answer = SessionDescription::new(SdpType::Answer, sdp, self.ctx.identity.uid.clone());
        match self.signaling.publish_answer(&answer).await? {
            AnswerPublish::Published => {}
            AnswerPublish::AlreadyAnswered => return Err(CallError::SessionFull),
        }

        session.deadline = Some(Instant::now() + self.ctx.negotiation_timeout);
        Ok(offer.sdp)
    }

    /// Undo a partial join: connection, tracks, subscriptions, presence.
    async fn rollback(&mut self, mut session: ActiveSession) {
        self.epoch += 1;

        if let Err(e) = session.peer.close().await {
            debug!(target: "call.negotiator", error = %e, "Peer close failed during rollback");
        }
        session.media.release_all();
        session.subscriptions.cancel();

        if session.presence.joined_at().is_some() {
            if let Err(e) = session.presence.withdraw().await {
                record_signaling_error("withdraw");
                warn!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    error = %e,
                    "Failed to withdraw presence during rollback"
                );
            }
        }
        if let Err(e) = self.signaling.purge_if_empty().await {
            debug!(target: "call.negotiator", error = %e, "Purge skipped during rollback");
        }

        self.set_state(NegotiatorState::Idle);
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Tear down the joined session, if any.
    ///
    /// The state moves to its terminal value before anything is awaited.
    /// Teardown order is connection, tracks, subscriptions.
    async fn close(&mut self, reason: CloseReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        self.set_state(reason.terminal_state());
        self.epoch += 1;

        if let Err(e) = session.peer.close().await {
            debug!(target: "call.negotiator", error = %e, "Peer close failed");
        }
        session.media.release_all();
        session.subscriptions.cancel();

        // A removed entry stays as the moderator left it.
        if !matches!(reason, CloseReason::RemovedBy(_)) {
            if let Err(e) = session.presence.withdraw().await {
                record_signaling_error("withdraw");
                warn!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    error = %e,
                    "Failed to withdraw presence"
                );
            }
        }
        if let Err(e) = self.signaling.purge_if_empty().await {
            warn!(
                target: "call.negotiator",
                channel_id = %self.signaling.channel_id(),
                error = %e,
                "Failed to check for an empty session"
            );
        }

        self.post_status(reason.status());
        record_leave(reason.as_str());
        info!(
            target: "call.negotiator",
            channel_id = %self.signaling.channel_id(),
            role = %session.role,
            reason = reason.as_str(),
            state = %self.state,
            "Call session closed"
        );
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, epoch: u64, event: SessionEvent) {
        if epoch != self.epoch || self.session.is_none() {
            debug!(target: "call.negotiator", epoch, "Dropping event for a closed session");
            return;
        }

        let close = match event {
            SessionEvent::Peer(PeerEvent::LocalCandidate(candidate)) => {
                self.publish_candidate(candidate).await
            }
            SessionEvent::Peer(PeerEvent::StateChanged(state)) => self.on_peer_state(state),
            SessionEvent::Peer(PeerEvent::RemoteTrack(info)) => {
                self.on_remote_track(info);
                None
            }
            SessionEvent::Session(SessionChange::Answer(answer)) => self.apply_answer(answer).await,
            SessionEvent::Session(SessionChange::OfferReplaced | SessionChange::Deleted) => {
                Some(CloseReason::SessionEnded)
            }
            SessionEvent::RemoteCandidate(record) => {
                self.apply_remote_candidate(record.candidate).await;
                None
            }
            SessionEvent::Roster(roster) => match self.on_roster(&roster) {
                RosterOutcome::Removed(by) => Some(CloseReason::RemovedBy(by)),
                RosterOutcome::CounterpartLeft(uid) => self.renegotiate(&uid).await,
                RosterOutcome::Unchanged => None,
            },
            SessionEvent::FeedClosed(feed) => {
                warn!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    feed,
                    "Change feed stopped unexpectedly"
                );
                Some(CloseReason::SignalingFailure)
            }
        };

        if let Some(reason) = close {
            self.close(reason).await;
        }
    }

    async fn publish_candidate(&self, candidate: IceCandidate) -> Option<CloseReason> {
        let role = self.session.as_ref()?.role;
        match self.signaling.append_candidate(role, &candidate).await {
            Ok(_) => {
                record_candidate("local", "published");
                None
            }
            Err(e) => {
                record_candidate("local", "error");
                record_signaling_error("candidate");
                let fatal = matches!(&e, CallError::Store(store) if store.is_unrecoverable());
                warn!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    error = %e,
                    fatal,
                    "Failed to publish local candidate"
                );
                fatal.then_some(CloseReason::SignalingFailure)
            }
        }
    }

    fn on_peer_state(&mut self, peer_state: PeerState) -> Option<CloseReason> {
        let role = self.session.as_ref()?.role;
        match (peer_state, self.state) {
            (PeerState::Connected, NegotiatorState::Negotiating) => {
                if let Some(session) = self.session.as_mut() {
                    record_negotiation_duration(role.as_str(), session.started_at.elapsed());
                    session.deadline = None;
                }
                self.set_state(NegotiatorState::Connected);
            }
            (PeerState::Connected, NegotiatorState::Disconnected) => {
                self.set_state(NegotiatorState::Connected);
            }
            (PeerState::Disconnected, NegotiatorState::Connected) => {
                // No renegotiation; recovery is up to the connection.
                self.set_state(NegotiatorState::Disconnected);
            }
            (PeerState::Failed, _) => return Some(CloseReason::ConnectionFailed),
            _ => {}
        }
        None
    }

    fn on_remote_track(&mut self, info: RemoteTrackInfo) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.inbound.iter().any(|t| t.track_id == info.track_id) {
            return;
        }
        debug!(
            target: "call.negotiator",
            stream_id = %info.stream_id,
            kind = %info.kind,
            "Inbound track attached"
        );
        session.inbound.push(info);
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Option<CloseReason> {
        let timeout = self.ctx.negotiation_timeout;
        let session = self.session.as_mut()?;
        if session.role != Role::Offerer || session.ledger.is_remote_ready() {
            // Remote description already set; a second arrival is ignored.
            return None;
        }

        if let Err(e) = session
            .peer
            .set_remote_description(SdpType::Answer, &answer.sdp)
            .await
        {
            warn!(
                target: "call.negotiator",
                channel_id = %self.signaling.channel_id(),
                error = %e,
                "Failed to apply answer"
            );
            return Some(CloseReason::ConnectionFailed);
        }

        session.deadline = Some(Instant::now() + timeout);
        session.counterpart = Some(answer.by.clone());
        let queued = session.ledger.mark_remote_ready();
        info!(
            target: "call.negotiator",
            channel_id = %self.signaling.channel_id(),
            by = %answer.by,
            queued_candidates = queued.len(),
            "Answer applied"
        );
        for candidate in &queued {
            add_candidate(session.peer.as_ref(), candidate).await;
        }
        None
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.ledger.accept(candidate) {
            Admission::Duplicate => record_candidate("remote", "duplicate"),
            Admission::Queued => record_candidate("remote", "queued"),
            Admission::Apply(candidate) => add_candidate(session.peer.as_ref(), &candidate).await,
        }
    }

    fn on_roster(&mut self, roster: &[Participant]) -> RosterOutcome {
        let Some(session) = self.session.as_mut() else {
            return RosterOutcome::Unchanged;
        };
        let delta = session.presence.observe(roster);
        session.roster = active_roster(roster);

        if let Some(by) = delta.removed_by {
            return RosterOutcome::Removed(by);
        }
        // Only a departure seen after an arrival counts; a roster delivery
        // that lags the answer never triggers a reset.
        match &session.counterpart {
            Some(uid) if delta.left.contains(uid) => RosterOutcome::CounterpartLeft(uid.clone()),
            _ => RosterOutcome::Unchanged,
        }
    }

    /// Start over with a fresh connection after `departed` left.
    ///
    /// Presence, tracks and the roster view carry over. Anything that fails
    /// here closes the session.
    async fn renegotiate(&mut self, departed: &UserId) -> Option<CloseReason> {
        info!(
            target: "call.negotiator",
            channel_id = %self.signaling.channel_id(),
            departed = %departed,
            "Counterpart left, renegotiating"
        );
        // A purged session ended the call; resetting would recreate it.
        match self.signaling.read_session().await {
            Ok(Some(_)) => {}
            Ok(None) => return Some(CloseReason::SessionEnded),
            Err(e) => {
                warn!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    error = %e,
                    "Failed to read session before renegotiating"
                );
                return Some(CloseReason::SignalingFailure);
            }
        }

        self.set_state(NegotiatorState::Negotiating);
        let mut session = self.session.take()?;

        self.epoch += 1;
        let epoch = self.epoch;
        session.subscriptions.cancel();
        if let Err(e) = session.peer.close().await {
            debug!(target: "call.negotiator", error = %e, "Peer close failed during renegotiation");
        }
        session.subscriptions = self.cancel_token.child_token();
        session.ledger = CandidateLedger::new();
        session.counterpart = None;
        session.inbound.clear();
        session.deadline = None;
        session.started_at = Instant::now();

        let result = self.restart(&mut session, epoch).await;
        let role = session.role;
        self.session = Some(session);

        match result {
            Ok(()) => {
                record_renegotiation(role.as_str(), "success");
                info!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    role = %role,
                    "Renegotiation started"
                );
                None
            }
            Err(e) => {
                record_renegotiation(role.as_str(), "error");
                warn!(
                    target: "call.negotiator",
                    channel_id = %self.signaling.channel_id(),
                    error = %e,
                    "Renegotiation failed"
                );
                Some(match e {
                    CallError::Peer(_) => CloseReason::ConnectionFailed,
                    _ => CloseReason::SignalingFailure,
                })
            }
        }
    }

    /// New connection with the current tracks, cleared slots, new role.
    async fn restart(&self, session: &mut ActiveSession, epoch: u64) -> Result<(), CallError> {
        let (peer, peer_events) = self
            .ctx
            .peers
            .create(PeerConfig {
                ice: self.ctx.ice.clone(),
                stream_id: session.media.stream_id().to_string(),
                audio: session.media.track(MediaKind::Audio).cloned(),
                video: session.media.track(MediaKind::Video).cloned(),
            })
            .await?;
        session.peer = peer;
        forward_peer_events(
            peer_events,
            epoch,
            session.subscriptions.clone(),
            self.events_tx.clone(),
        );

        self.signaling.reset_session().await?;
        let others = active_others(&session.roster, &self.ctx.identity.uid);
        let offer_sdp = self.arbitrate(session, None, others).await?;
        self.subscribe(session, offer_sdp, epoch).await
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    async fn set_device_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        let previous = self.desired.get(kind);
        self.desired.set(kind, enabled);

        let Some(session) = self.session.as_mut() else {
            // Applied on the next join.
            return Ok(());
        };

        let result = session.apply_device(kind, enabled).await;
        if result.is_ok() {
            let (has_audio, has_video) = session.sending();
            if let Err(e) = session.presence.update_media(has_audio, has_video).await {
                record_signaling_error("presence");
                warn!(
                    target: "call.negotiator",
                    kind = %kind,
                    error = %e,
                    "Failed to publish device state"
                );
            }
        }

        match result {
            Ok(()) => {
                record_device_toggle(kind.as_str(), if enabled { "enabled" } else { "disabled" });
                Ok(())
            }
            Err(e) => {
                self.desired.set(kind, previous);
                record_device_toggle(kind.as_str(), "error");
                warn!(
                    target: "call.negotiator",
                    kind = %kind,
                    error = %e,
                    "Device toggle failed"
                );
                self.post_status(StatusMessage::new(StatusKind::Info, e.client_message()));
                Err(e)
            }
        }
    }
}

async fn add_candidate(peer: &dyn PeerConnection, candidate: &IceCandidate) {
    match peer.add_ice_candidate(candidate).await {
        Ok(()) => record_candidate("remote", "applied"),
        Err(e) => {
            record_candidate("remote", "error");
            warn!(
                target: "call.negotiator",
                error = %e,
                "Failed to apply remote candidate"
            );
        }
    }
}

/// Pump a change feed into the session event channel until cancelled.
fn forward<T, F>(
    mut feed: ChangeFeed<T>,
    wrap: F,
    name: &'static str,
    epoch: u64,
    token: CancellationToken,
    events: mpsc::UnboundedSender<Tagged>,
) where
    T: Send + 'static,
    F: Fn(T) -> SessionEvent + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                item = feed.next() => match item {
                    Some(item) => {
                        if events.send((epoch, wrap(item))).is_err() {
                            break;
                        }
                    }
                    None => {
                        if !token.is_cancelled() {
                            let _ = events.send((epoch, SessionEvent::FeedClosed(name)));
                        }
                        break;
                    }
                },
            }
        }
    });
}

fn forward_peer_events(
    mut peer_events: PeerEvents,
    epoch: u64,
    token: CancellationToken,
    events: mpsc::UnboundedSender<Tagged>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                event = peer_events.recv() => match event {
                    Some(event) => {
                        if events.send((epoch, SessionEvent::Peer(event))).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
}
