//! `SessionController` - reconciles the user's desired call with the live
//! negotiator.
//!
//! The controller is the only component the user interface talks to. It
//! holds at most one [`SessionNegotiator`] and applies requests strictly one
//! at a time: a channel switch fully leaves the old session before the new
//! join starts, so two sessions never overlap.
//!
//! When a negotiator reaches a terminal state on its own (removal, remote
//! end, failure) the controller keeps its final status message and forgets
//! the desired session so that it is not rejoined.
//!
//! Process exit goes through [`SessionControllerHandle::teardown_blocking`],
//! which marks the local roster entry `left` with a synchronous write when
//! there is no time left for the async shutdown path.

use super::messages::{
    ControllerMessage, ControllerStatus, DesiredMedia, DesiredSession, SessionView, StatusKind,
    StatusMessage,
};
use super::negotiator::{NegotiatorHandle, SessionNegotiator};
use crate::context::CallContext;
use crate::errors::CallError;
use crate::model::MediaKind;
use crate::prefs::{PreferenceStore, VolumePreference};
use crate::presence;
use crate::router;
use crate::signaling::SignalingChannel;
use common::types::{ChannelId, UserId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 64;

/// Bound on waiting for a negotiator task after leaving.
const NEGOTIATOR_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// What a synchronous teardown needs to mark this client as left.
#[derive(Clone)]
struct TeardownTarget {
    signaling: SignalingChannel,
    uid: UserId,
}

type TeardownSlot = Arc<Mutex<Option<TeardownTarget>>>;

/// Handle to the `SessionController`.
#[derive(Clone)]
pub struct SessionControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    teardown: TeardownSlot,
}

impl SessionControllerHandle {
    /// Spawn the controller with no desired session.
    ///
    /// `media` is the initial device preference applied to every join.
    #[must_use]
    pub fn spawn(
        ctx: CallContext,
        prefs: PreferenceStore,
        media: DesiredMedia,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let teardown: TeardownSlot = Arc::new(Mutex::new(None));

        let actor = SessionController {
            ctx,
            prefs,
            receiver,
            cancel_token: cancel_token.clone(),
            teardown: Arc::clone(&teardown),
            desired: None,
            media,
            current: None,
            status: None,
        };

        let task_handle = tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
                teardown,
            },
            task_handle,
        )
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControllerMessage,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Set the session the user wants to be in; `None` leaves.
    ///
    /// Resolves after the transition has completed.
    ///
    /// # Errors
    ///
    /// Returns the join error when the new session could not be joined. The
    /// desired session is cleared in that case.
    pub async fn set_desired_session(
        &self,
        desired: Option<DesiredSession>,
    ) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::SetDesired {
            desired,
            respond_to,
        })
        .await?
    }

    /// Show or hide the call panel. The connection is unaffected.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Internal` if the controller is gone.
    pub async fn set_visible(&self, visible: bool) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::SetVisible {
            visible,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// Returns `CallError::Media` when the device cannot be started.
    pub async fn set_device_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::SetDeviceEnabled {
            kind,
            enabled,
            respond_to,
        })
        .await?
    }

    /// Remove `target` from the current channel's call.
    ///
    /// Returns `false` when the target was not an active participant.
    ///
    /// # Errors
    ///
    /// - `CallError::NotJoined` without a current channel
    /// - `CallError::KickUnsupported` / `CallError::PermissionDenied`
    pub async fn kick(&self, target: UserId) -> Result<bool, CallError> {
        self.request(|respond_to| ControllerMessage::Kick { target, respond_to })
            .await?
    }

    /// Store the local playback preference for `remote`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Internal` if the preference file cannot be written.
    pub async fn set_volume(
        &self,
        remote: UserId,
        preference: VolumePreference,
    ) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::SetVolume {
            remote,
            preference,
            respond_to,
        })
        .await?
    }

    /// # Errors
    ///
    /// Returns `CallError::Internal` if the controller is gone.
    pub async fn status(&self) -> Result<ControllerStatus, CallError> {
        self.request(|respond_to| ControllerMessage::GetStatus { respond_to })
            .await
    }

    /// Leave any session and stop the controller.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Internal` if the controller is already gone.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::Shutdown { respond_to })
            .await?
    }

    /// Mark the local participant `left` with a blocking write.
    ///
    /// Intended for process exit when the async runtime may not get to run
    /// the normal leave. Returns `false` when no session was joined.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the write fails.
    pub fn teardown_blocking(&self) -> Result<bool, CallError> {
        let target = self
            .teardown
            .lock()
            .map_err(|_| CallError::Internal("teardown slot poisoned".to_string()))?
            .clone();
        let Some(target) = target else {
            return Ok(false);
        };

        target.signaling.mark_left_blocking(&target.uid)?;
        info!(
            target: "call.controller",
            channel_id = %target.signaling.channel_id(),
            "Participant marked left during teardown"
        );
        Ok(true)
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The negotiator currently owned by the controller.
struct ActiveCall {
    channel_id: ChannelId,
    handle: NegotiatorHandle,
    task_handle: JoinHandle<()>,
    view: watch::Receiver<SessionView>,
}

/// The `SessionController` actor.
pub struct SessionController {
    ctx: CallContext,
    prefs: PreferenceStore,
    receiver: mpsc::Receiver<ControllerMessage>,
    cancel_token: CancellationToken,
    teardown: TeardownSlot,
    desired: Option<DesiredSession>,
    media: DesiredMedia,
    current: Option<ActiveCall>,
    /// Outlives the session that posted it.
    status: Option<StatusMessage>,
}

/// Resolves when the current negotiator publishes a new view. `false` means
/// the negotiator is gone. Never resolves without a negotiator.
async fn session_changed(current: &mut Option<ActiveCall>) -> bool {
    match current {
        Some(call) => call.view.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

impl SessionController {
    #[instrument(skip_all, name = "call.actor.controller", fields(uid = %self.ctx.identity.uid))]
    async fn run(mut self) {
        info!(
            target: "call.controller",
            uid = %self.ctx.identity.uid,
            "SessionController started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "call.controller",
                        "SessionController received cancellation signal"
                    );
                    if let Err(e) = self.leave_current().await {
                        warn!(target: "call.controller", error = %e, "Leave during shutdown failed");
                    }
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(
                                target: "call.controller",
                                "SessionController channel closed, exiting"
                            );
                            if let Err(e) = self.leave_current().await {
                                warn!(target: "call.controller", error = %e, "Leave on exit failed");
                            }
                            break;
                        }
                    }
                }

                alive = session_changed(&mut self.current) => {
                    self.on_session_changed(alive).await;
                }
            }
        }

        info!(
            target: "call.controller",
            uid = %self.ctx.identity.uid,
            "SessionController stopped"
        );
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::SetDesired {
                desired,
                respond_to,
            } => {
                let result = self.set_desired(desired).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::SetVisible {
                visible,
                respond_to,
            } => {
                if let Some(desired) = self.desired.as_mut() {
                    desired.visible = visible;
                }
                let _ = respond_to.send(());
            }

            ControllerMessage::SetDeviceEnabled {
                kind,
                enabled,
                respond_to,
            } => {
                let result = self.set_device_enabled(kind, enabled).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::Kick { target, respond_to } => {
                let result = self.kick(&target).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::SetVolume {
                remote,
                preference,
                respond_to,
            } => {
                let result = self
                    .prefs
                    .set(&self.ctx.identity.uid, &remote, preference)
                    .map_err(|e| CallError::Internal(e.to_string()));
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            ControllerMessage::Shutdown { respond_to } => {
                let result = self.leave_current().await;
                self.desired = None;
                let _ = respond_to.send(result);
                self.cancel_token.cancel();
            }
        }
    }

    fn adopt_status(&mut self, status: Option<StatusMessage>) {
        if let Some(status) = status {
            if status.overrides(self.status.as_ref()) {
                self.status = Some(status);
            }
        }
    }

    fn set_teardown(&self, target: Option<TeardownTarget>) {
        match self.teardown.lock() {
            Ok(mut slot) => *slot = target,
            Err(_) => warn!(target: "call.controller", "Teardown slot poisoned"),
        }
    }

    async fn set_desired(&mut self, desired: Option<DesiredSession>) -> Result<(), CallError> {
        let same_channel = matches!(
            (&desired, &self.current),
            (Some(next), Some(call)) if next.channel_id == call.channel_id
        );
        if same_channel {
            // Already there; only presentation changes.
            self.desired = desired;
            return Ok(());
        }

        self.leave_current().await?;
        self.desired.clone_from(&desired);

        let Some(next) = desired else {
            return Ok(());
        };

        self.status = None;
        let mut ctx = self.ctx.clone();
        ctx.identity.display_name.clone_from(&next.display_name);

        let (handle, task_handle) = SessionNegotiator::spawn(
            ctx,
            next.channel_id.clone(),
            self.media,
            self.cancel_token.child_token(),
        );

        match handle.join().await {
            Ok(role) => {
                info!(
                    target: "call.controller",
                    channel_id = %next.channel_id,
                    role = %role,
                    "Call session joined"
                );
                self.set_teardown(Some(TeardownTarget {
                    signaling: self.ctx.signaling(next.channel_id.clone()),
                    uid: self.ctx.identity.uid.clone(),
                }));
                self.current = Some(ActiveCall {
                    channel_id: next.channel_id,
                    view: handle.subscribe(),
                    handle,
                    task_handle,
                });
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "call.controller",
                    channel_id = %next.channel_id,
                    error = %e,
                    "Join failed"
                );
                self.status = Some(StatusMessage::new(StatusKind::Failed, e.client_message()));
                self.desired = None;
                let _ = handle.leave().await;
                wait_for_exit(&next.channel_id, task_handle).await;
                Err(e)
            }
        }
    }

    /// Leave the current session and wait for its negotiator to exit.
    async fn leave_current(&mut self) -> Result<(), CallError> {
        let Some(call) = self.current.take() else {
            return Ok(());
        };

        debug!(
            target: "call.controller",
            channel_id = %call.channel_id,
            "Leaving call session"
        );
        // The teardown target stays armed until the roster entry is
        // withdrawn, so a leave cut short by process exit still marks it.
        let result = call.handle.leave().await;
        self.set_teardown(None);
        self.adopt_status(call.handle.view().status);
        wait_for_exit(&call.channel_id, call.task_handle).await;
        result
    }

    async fn on_session_changed(&mut self, alive: bool) {
        let Some(call) = self.current.as_ref() else {
            return;
        };
        let view = call.view.borrow().clone();
        let ended = !alive || view.state.is_terminal();
        self.adopt_status(view.status);

        if !ended {
            return;
        }

        if let Some(call) = self.current.take() {
            info!(
                target: "call.controller",
                channel_id = %call.channel_id,
                state = %view.state,
                "Call session ended"
            );
            self.set_teardown(None);
            self.desired = None;
            wait_for_exit(&call.channel_id, call.task_handle).await;
        }
    }

    async fn set_device_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        let previous = self.media.get(kind);
        self.media.set(kind, enabled);

        let Some(call) = self.current.as_ref() else {
            return Ok(());
        };
        let result = call.handle.set_device_enabled(kind, enabled).await;
        if result.is_err() {
            self.media.set(kind, previous);
        }
        result
    }

    async fn kick(&self, target: &UserId) -> Result<bool, CallError> {
        let Some(desired) = self.desired.as_ref() else {
            return Err(CallError::NotJoined);
        };
        let signaling = self.ctx.signaling(desired.channel_id.clone());
        presence::kick(
            &signaling,
            self.ctx.authorizer.as_ref(),
            self.ctx.capabilities.supports_kick,
            &self.ctx.identity.uid,
            target,
        )
        .await
    }

    fn get_status(&self) -> ControllerStatus {
        let session = self.current.as_ref().map(|call| call.view.borrow().clone());

        let tiles = session
            .as_ref()
            .map(|view| {
                // Self renders the camera only while video is on.
                let local_stream = view
                    .local
                    .stream_id
                    .as_deref()
                    .filter(|_| view.local.video);
                router::route(
                    &self.ctx.identity.uid,
                    local_stream,
                    &view.roster,
                    &view.inbound,
                    &self.prefs,
                )
            })
            .unwrap_or_default();

        let status = session
            .as_ref()
            .and_then(|view| view.status.clone())
            .filter(|status| status.overrides(self.status.as_ref()))
            .or_else(|| self.status.clone());

        ControllerStatus {
            desired: self.desired.clone(),
            media: self.media,
            session,
            status,
            tiles,
        }
    }
}

async fn wait_for_exit(channel_id: &ChannelId, task_handle: JoinHandle<()>) {
    match tokio::time::timeout(NEGOTIATOR_EXIT_TIMEOUT, task_handle).await {
        Ok(Ok(())) => {
            debug!(
                target: "call.controller",
                channel_id = %channel_id,
                "Negotiator task completed cleanly"
            );
        }
        Ok(Err(e)) => {
            warn!(
                target: "call.controller",
                channel_id = %channel_id,
                error = ?e,
                "Negotiator task panicked"
            );
        }
        Err(_) => {
            warn!(
                target: "call.controller",
                channel_id = %channel_id,
                "Negotiator task exit timed out"
            );
        }
    }
}
