//! Session negotiator integration tests.
//!
//! Every client shares one in-memory store and uses fake connections that
//! connect as soon as both descriptions are set.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use call_session::actors::{
    DesiredMedia, NegotiatorHandle, NegotiatorState, SessionNegotiator, SessionView, StatusKind,
};
use call_session::errors::{CallError, MediaError};
use call_session::model::{
    IceCandidate, MediaKind, ParticipantStatus, Role, SdpType, SessionDescription,
};
use call_session::presence;
use call_session::store::{DocumentStore, StoreOp};
use call_test_utils::*;
use common::types::UserId;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SESSION_PATH: &str = "channel/general/call/active";
const PARTICIPANTS_PATH: &str = "channel/general/call/active/participants";

fn spawn_negotiator(client: &TestClient) -> (NegotiatorHandle, JoinHandle<()>) {
    spawn_with_media(client, DesiredMedia::default())
}

fn spawn_with_media(
    client: &TestClient,
    desired: DesiredMedia,
) -> (NegotiatorHandle, JoinHandle<()>) {
    SessionNegotiator::spawn(
        client.ctx.clone(),
        TestNetwork::channel(),
        desired,
        CancellationToken::new(),
    )
}

async fn wait_for_state(
    view: &mut watch::Receiver<SessionView>,
    state: NegotiatorState,
) -> SessionView {
    wait_for_view(view, state.as_str(), |v| v.state == state).await
}

/// Join `first` then `second` and wait until both are connected.
async fn connect_pair(
    first: &TestClient,
    second: &TestClient,
) -> (NegotiatorHandle, NegotiatorHandle) {
    let (a, _) = spawn_negotiator(first);
    let (b, _) = spawn_negotiator(second);

    assert_eq!(a.join().await.unwrap(), Role::Offerer);
    assert_eq!(b.join().await.unwrap(), Role::Answerer);

    wait_for_state(&mut a.subscribe(), NegotiatorState::Connected).await;
    wait_for_state(&mut b.subscribe(), NegotiatorState::Connected).await;
    (a, b)
}

#[tokio::test]
async fn test_first_joiner_becomes_offerer() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let (handle, _task) = spawn_negotiator(&alice);

    let role = handle.join().await.unwrap();
    assert_eq!(role, Role::Offerer);

    let view = wait_for_view(&mut handle.subscribe(), "offerer negotiating", |v| {
        v.state == NegotiatorState::Negotiating && v.role == Some(Role::Offerer)
    })
    .await;
    assert!(view.local.audio);
    assert!(!view.local.video);

    let signaling = alice.ctx.signaling(TestNetwork::channel());
    let session = signaling.read_session().await.unwrap().unwrap();
    let offer = session.offer.unwrap();
    assert_eq!(offer.by, alice.uid);
    assert!(session.answer.is_none());

    let roster = signaling.read_roster().await.unwrap();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].uid, alice.uid);
    assert!(roster[0].is_active());
    assert!(roster[0].has_audio);
    assert_eq!(roster[0].stream_id, view.local.stream_id);

    // A lone offerer only published candidates, it applied none.
    let tap = alice.peers.last_peer().unwrap();
    assert!(tap.applied_candidates().is_empty());
}

#[tokio::test]
async fn test_second_joiner_answers_and_both_connect() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");

    let (a, b) = connect_pair(&alice, &bob).await;

    let signaling = alice.ctx.signaling(TestNetwork::channel());
    let session = signaling.read_session().await.unwrap().unwrap();
    assert_eq!(session.offer.unwrap().by, alice.uid);
    assert_eq!(session.answer.unwrap().by, bob.uid);

    let active: Vec<_> = signaling
        .read_roster()
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.is_active())
        .collect();
    assert_eq!(active.len(), 2);

    let alice_tap = alice.peers.last_peer().unwrap();
    let bob_tap = bob.peers.last_peer().unwrap();
    wait_until("alice applied bob's candidates", || {
        alice_tap.applied_candidates().len() == DEFAULT_LOCAL_CANDIDATES
    })
    .await;
    wait_until("bob applied alice's candidates", || {
        bob_tap.applied_candidates().len() == DEFAULT_LOCAL_CANDIDATES
    })
    .await;

    let bob_view = wait_for_view(&mut b.subscribe(), "bob sees alice's audio", |v| {
        !v.inbound.is_empty() && v.roster.len() == 2
    })
    .await;
    assert_eq!(bob_view.inbound[0].stream_id, alice_tap.stream_id());
    assert_eq!(bob_view.inbound[0].kind, MediaKind::Audio);

    let alice_view = wait_for_view(&mut a.subscribe(), "alice sees bob", |v| {
        v.roster.len() == 2 && !v.inbound.is_empty()
    })
    .await;
    assert_eq!(alice_view.inbound[0].stream_id, bob_tap.stream_id());
}

#[tokio::test]
async fn test_simultaneous_joins_elect_one_offerer() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (a, _) = spawn_negotiator(&alice);
    let (b, _) = spawn_negotiator(&bob);

    let (role_a, role_b) = tokio::join!(a.join(), b.join());
    let mut roles = vec![role_a.unwrap(), role_b.unwrap()];
    roles.sort_by_key(|r| r.as_str());
    assert_eq!(roles, vec![Role::Answerer, Role::Offerer]);

    wait_for_state(&mut a.subscribe(), NegotiatorState::Connected).await;
    wait_for_state(&mut b.subscribe(), NegotiatorState::Connected).await;
}

#[tokio::test]
async fn test_third_joiner_is_rejected_and_rolled_back() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let carol = network.client("carol");
    let (_a, _b) = connect_pair(&alice, &bob).await;

    let (c, _) = spawn_negotiator(&carol);
    let err = c.join().await.unwrap_err();
    assert!(matches!(err, CallError::SessionFull));
    assert_eq!(c.view().state, NegotiatorState::Idle);
    assert_eq!(carol.media.live_tracks(MediaKind::Audio), 0);
    assert!(carol.peers.last_peer().unwrap().is_closed());

    let roster = alice
        .ctx
        .signaling(TestNetwork::channel())
        .read_roster()
        .await
        .unwrap();
    assert!(roster.iter().all(|p| p.uid != carol.uid));
}

#[tokio::test]
async fn test_offerer_leave_hands_session_to_answerer() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let carol = network.client("carol");
    let (a, b) = connect_pair(&alice, &bob).await;

    a.leave().await.unwrap();
    let view = wait_for_state(&mut a.subscribe(), NegotiatorState::Closed).await;
    assert_eq!(view.status.unwrap().kind, StatusKind::Left);
    assert_eq!(alice.media.live_tracks(MediaKind::Audio), 0);
    assert!(alice.peers.last_peer().unwrap().is_closed());

    // Bob stays in the call and starts over as the offerer.
    let bob_view = wait_for_view(&mut b.subscribe(), "bob offers again", |v| {
        v.roster.len() == 1
            && v.state == NegotiatorState::Negotiating
            && v.role == Some(Role::Offerer)
    })
    .await;
    assert_eq!(bob_view.roster[0].uid, bob.uid);
    assert_eq!(bob.peers.created_count(), 2);
    assert!(bob.peers.peers()[0].is_closed());

    let signaling = bob.ctx.signaling(TestNetwork::channel());
    let session = signaling.read_session().await.unwrap().unwrap();
    assert_eq!(session.offer.unwrap().by, bob.uid);
    assert!(session.answer.is_none());

    let (c, _) = spawn_negotiator(&carol);
    assert_eq!(c.join().await.unwrap(), Role::Answerer);
    wait_for_state(&mut b.subscribe(), NegotiatorState::Connected).await;
    wait_for_state(&mut c.subscribe(), NegotiatorState::Connected).await;
}

#[tokio::test]
async fn test_answerer_can_rejoin_after_leaving() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (a, b) = connect_pair(&alice, &bob).await;

    b.leave().await.unwrap();
    wait_for_state(&mut b.subscribe(), NegotiatorState::Closed).await;

    let (rejoined, _) = spawn_negotiator(&bob);
    rejoined.join().await.unwrap();

    wait_until("alice replaced her connection", || {
        alice.peers.created_count() == 2
    })
    .await;
    wait_for_view(&mut a.subscribe(), "alice connected to bob again", |v| {
        v.state == NegotiatorState::Connected && v.roster.len() == 2
    })
    .await;
    wait_for_state(&mut rejoined.subscribe(), NegotiatorState::Connected).await;
    assert!(alice.peers.peers()[0].is_closed());
    assert!(alice.peers.last_peer().unwrap().is_connected());

    let session = alice
        .ctx
        .signaling(TestNetwork::channel())
        .read_session()
        .await
        .unwrap()
        .unwrap();
    let authors: HashSet<UserId> = [session.offer.unwrap().by, session.answer.unwrap().by]
        .into_iter()
        .collect();
    assert_eq!(authors, HashSet::from([alice.uid.clone(), bob.uid.clone()]));
}

#[tokio::test]
async fn test_slot_held_by_departed_participant_is_reclaimed_after_timeout() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network
        .client("bob")
        .with_negotiation_timeout(Duration::from_millis(200));

    let (a, _) = spawn_negotiator(&alice);
    a.join().await.unwrap();
    // An answer from someone who never appeared on the roster.
    let signaling = alice.ctx.signaling(TestNetwork::channel());
    let ghost = SessionDescription::new(SdpType::Answer, "v=0\r\n", UserId::new("ghost"));
    signaling.publish_answer(&ghost).await.unwrap();

    let (b, _) = spawn_negotiator(&bob);
    assert_eq!(b.join().await.unwrap(), Role::Offerer);

    let session = signaling.read_session().await.unwrap().unwrap();
    assert_eq!(session.offer.unwrap().by, bob.uid);
    assert!(session.answer.is_none());

    let view = wait_for_state(&mut a.subscribe(), NegotiatorState::Closed).await;
    assert_eq!(view.status.unwrap().kind, StatusKind::Ended);
}

#[tokio::test]
async fn test_last_leave_purges_session() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let carol = network.client("carol");
    let (a, b) = connect_pair(&alice, &bob).await;

    a.leave().await.unwrap();
    assert!(network.store().has_documents_under(SESSION_PATH));
    b.leave().await.unwrap();
    assert!(!network.store().has_documents_under("channel/general/call"));

    let (c, _) = spawn_negotiator(&carol);
    assert_eq!(c.join().await.unwrap(), Role::Offerer);
}

#[tokio::test]
async fn test_abandoned_session_is_reclaimed() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");

    let (a, _) = spawn_negotiator(&alice);
    a.join().await.unwrap();
    // Alice's entry vanishes without the session being cleaned up.
    network
        .store()
        .delete(&format!("{PARTICIPANTS_PATH}/alice"))
        .await
        .unwrap();

    let (b, _) = spawn_negotiator(&bob);
    assert_eq!(b.join().await.unwrap(), Role::Offerer);

    let session = bob
        .ctx
        .signaling(TestNetwork::channel())
        .read_session()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.offer.unwrap().by, bob.uid);

    // Alice negotiated against the replaced offer.
    let view = wait_for_state(&mut a.subscribe(), NegotiatorState::Closed).await;
    assert_eq!(view.status.unwrap().kind, StatusKind::Ended);
}

#[tokio::test]
async fn test_duplicate_candidate_is_applied_once() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (_a, _b) = connect_pair(&alice, &bob).await;

    let alice_tap = alice.peers.last_peer().unwrap();
    wait_until("alice applied bob's candidates", || {
        alice_tap.applied_candidates().len() == DEFAULT_LOCAL_CANDIDATES
    })
    .await;

    let signaling = bob.ctx.signaling(TestNetwork::channel());
    let duplicate = alice_tap.applied_candidates()[0].clone();
    signaling
        .append_candidate(Role::Answerer, &duplicate)
        .await
        .unwrap();
    let fresh = IceCandidate {
        candidate: "candidate:9 1 udp 1686052607 203.0.113.7 61000 typ srflx".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    signaling
        .append_candidate(Role::Answerer, &fresh)
        .await
        .unwrap();

    // The log is delivered in order, so the duplicate was seen first.
    wait_until("fresh candidate applied", || {
        alice_tap.applied_candidates().contains(&fresh)
    })
    .await;
    let applied = alice_tap.applied_candidates();
    assert_eq!(applied.len(), DEFAULT_LOCAL_CANDIDATES + 1);
    assert_eq!(applied.iter().filter(|c| **c == duplicate).count(), 1);
}

#[tokio::test]
async fn test_device_toggle_does_not_renegotiate() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (a, b) = connect_pair(&alice, &bob).await;

    let signaling = alice.ctx.signaling(TestNetwork::channel());
    let session_before = signaling.read_session().await.unwrap();
    let tap = alice.peers.last_peer().unwrap();
    let local_before = tap.local_description();

    a.set_device_enabled(MediaKind::Video, true).await.unwrap();
    a.set_device_enabled(MediaKind::Video, false).await.unwrap();
    a.set_device_enabled(MediaKind::Video, true).await.unwrap();
    a.set_device_enabled(MediaKind::Audio, false).await.unwrap();

    let view = a.view();
    assert_eq!(view.state, NegotiatorState::Connected);
    assert!(view.local.video);
    assert!(!view.local.audio);
    assert!(view.desired.video);

    assert_eq!(signaling.read_session().await.unwrap(), session_before);
    assert_eq!(tap.local_description(), local_before);
    assert_eq!(alice.peers.created_count(), 1);
    assert_eq!(alice.media.live_tracks(MediaKind::Video), 1);

    let replaced: Vec<_> = tap
        .replaced_tracks()
        .into_iter()
        .map(|(kind, track)| (kind, track.is_some()))
        .collect();
    assert_eq!(
        replaced,
        vec![
            (MediaKind::Video, true),
            (MediaKind::Video, false),
            (MediaKind::Video, true),
        ]
    );

    let bob_view = wait_for_view(&mut b.subscribe(), "bob sees alice's camera", |v| {
        v.roster
            .iter()
            .any(|p| p.uid == alice.uid && p.has_video && !p.has_audio)
    })
    .await;
    assert_eq!(bob_view.state, NegotiatorState::Connected);
}

#[tokio::test]
async fn test_camera_failure_joins_listen_only() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    alice.media.fail(MediaKind::Video, MediaError::PermissionDenied);

    let (a, _) = spawn_with_media(
        &alice,
        DesiredMedia {
            audio: true,
            video: true,
        },
    );
    assert_eq!(a.join().await.unwrap(), Role::Offerer);

    let view = a.view();
    assert_eq!(view.state, NegotiatorState::Negotiating);
    assert!(view.local.audio);
    assert!(!view.local.video);
    assert_eq!(view.status.unwrap().kind, StatusKind::Info);

    let err = a
        .set_device_enabled(MediaKind::Video, true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Media {
            kind: MediaKind::Video,
            ..
        }
    ));
    assert_eq!(a.view().state, NegotiatorState::Negotiating);

    alice.media.heal(MediaKind::Video);
    a.set_device_enabled(MediaKind::Video, true).await.unwrap();
    assert!(a.view().local.video);
}

#[tokio::test]
async fn test_denied_presence_write_rolls_back_join() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    network.store().deny(StoreOp::Write, PARTICIPANTS_PATH);

    let (a, _) = spawn_negotiator(&alice);
    let err = a.join().await.unwrap_err();
    assert!(matches!(err, CallError::Store(_)));

    assert_eq!(a.view().state, NegotiatorState::Idle);
    assert_eq!(alice.media.live_tracks(MediaKind::Audio), 0);
    assert!(alice.peers.last_peer().unwrap().is_closed());
    assert!(!network.store().has_documents_under("channel/general"));

    // The same negotiator can try again once writes are allowed.
    network.store().allow_all();
    assert_eq!(a.join().await.unwrap(), Role::Offerer);
    assert_eq!(alice.peers.created_count(), 2);
}

#[tokio::test]
async fn test_leave_falls_back_to_soft_left() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (a, b) = connect_pair(&alice, &bob).await;
    network
        .store()
        .deny(StoreOp::Delete, format!("{PARTICIPANTS_PATH}/"));

    a.leave().await.unwrap();

    let roster = bob
        .ctx
        .signaling(TestNetwork::channel())
        .read_roster()
        .await
        .unwrap();
    let entry = roster.iter().find(|p| p.uid == alice.uid).unwrap();
    assert_eq!(entry.status, ParticipantStatus::Left);

    wait_for_view(&mut b.subscribe(), "bob's roster drops alice", |v| {
        v.roster.iter().all(|p| p.uid != alice.uid)
    })
    .await;
}

#[tokio::test]
async fn test_kick_removes_target() {
    let network = TestNetwork::new().with_manager("alice");
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (a, b) = connect_pair(&alice, &bob).await;

    let signaling = alice.ctx.signaling(TestNetwork::channel());
    let removed = presence::kick(
        &signaling,
        alice.ctx.authorizer.as_ref(),
        alice.ctx.capabilities.supports_kick,
        &alice.uid,
        &bob.uid,
    )
    .await
    .unwrap();
    assert!(removed);

    let view = wait_for_state(&mut b.subscribe(), NegotiatorState::Closed).await;
    let status = view.status.unwrap();
    assert_eq!(status.kind, StatusKind::Removed);
    assert!(status.text.contains("alice"));
    wait_until("bob released his microphone", || {
        bob.media.live_tracks(MediaKind::Audio) == 0
    })
    .await;

    // The moderator's record of the removal stays in place.
    let roster = signaling.read_roster().await.unwrap();
    let entry = roster.iter().find(|p| p.uid == bob.uid).unwrap();
    assert_eq!(entry.status, ParticipantStatus::Removed);
    assert_eq!(entry.kicked_by.as_ref(), Some(&alice.uid));

    // Alice stays and waits for a new answerer.
    let alice_view = wait_for_view(&mut a.subscribe(), "alice offers again", |v| {
        v.roster.len() == 1 && v.state == NegotiatorState::Negotiating
    })
    .await;
    assert_eq!(alice_view.role, Some(Role::Offerer));
}

#[tokio::test]
async fn test_removal_counts_regardless_of_moderator_clock() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (_a, b) = connect_pair(&alice, &bob).await;

    let removed_at = chrono::Utc::now() - chrono::Duration::seconds(60);
    let update = serde_json::json!({
        "status": "removed",
        "kickedBy": "owner",
        "removedAt": removed_at,
    });
    network
        .store()
        .merge(
            &format!("{PARTICIPANTS_PATH}/bob"),
            update.as_object().unwrap().clone(),
        )
        .await
        .unwrap();

    let view = wait_for_state(&mut b.subscribe(), NegotiatorState::Closed).await;
    let status = view.status.unwrap();
    assert_eq!(status.kind, StatusKind::Removed);
    assert!(status.text.contains("owner"));
}

#[tokio::test]
async fn test_kick_requires_manage_permission() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (_a, b) = connect_pair(&alice, &bob).await;

    let err = presence::kick(
        &alice.ctx.signaling(TestNetwork::channel()),
        alice.ctx.authorizer.as_ref(),
        true,
        &alice.uid,
        &bob.uid,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CallError::PermissionDenied(_)));
    assert_eq!(b.view().state, NegotiatorState::Connected);
}

#[tokio::test]
async fn test_session_deletion_ends_call_for_everyone() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (a, b) = connect_pair(&alice, &bob).await;

    network.store().delete(SESSION_PATH).await.unwrap();

    for handle in [&a, &b] {
        let view = wait_for_state(&mut handle.subscribe(), NegotiatorState::Closed).await;
        assert_eq!(view.status.unwrap().kind, StatusKind::Ended);
    }
    wait_until("roster purged", || {
        !network.store().has_documents_under(PARTICIPANTS_PATH)
    })
    .await;
}

#[tokio::test]
async fn test_connection_loss_and_recovery() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let bob = network.client("bob");
    let (a, _b) = connect_pair(&alice, &bob).await;
    let tap = alice.peers.last_peer().unwrap();
    let mut view = a.subscribe();

    assert!(tap.disconnect());
    wait_for_state(&mut view, NegotiatorState::Disconnected).await;
    assert!(tap.reconnect());
    wait_for_state(&mut view, NegotiatorState::Connected).await;

    assert!(tap.fail());
    let failed = wait_for_state(&mut view, NegotiatorState::Failed).await;
    assert_eq!(failed.status.unwrap().kind, StatusKind::Failed);
    wait_until("connection and tracks released", || {
        tap.is_closed() && alice.media.live_tracks(MediaKind::Audio) == 0
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_offerer_waits_indefinitely() {
    let network = TestNetwork::new();
    let alice = network
        .client("alice")
        .with_negotiation_timeout(Duration::from_secs(2));
    let (a, _) = spawn_negotiator(&alice);
    a.join().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(a.view().state, NegotiatorState::Negotiating);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_negotiation_times_out() {
    let network = TestNetwork::new();
    let timeout = Duration::from_secs(2);
    let alice = network
        .client_with_peers("alice", FakePeerFactory::new().without_auto_connect())
        .with_negotiation_timeout(timeout);
    let bob = network
        .client_with_peers("bob", FakePeerFactory::new().without_auto_connect())
        .with_negotiation_timeout(timeout);

    let (a, _) = spawn_negotiator(&alice);
    let (b, _) = spawn_negotiator(&bob);
    a.join().await.unwrap();
    b.join().await.unwrap();

    for handle in [&a, &b] {
        let view = wait_for_state(&mut handle.subscribe(), NegotiatorState::Failed).await;
        assert_eq!(view.status.unwrap().kind, StatusKind::Failed);
    }
    wait_until("session purged", || {
        !network.store().has_documents_under("channel/general/call")
    })
    .await;
}

#[tokio::test]
async fn test_join_twice_is_rejected() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let (a, _) = spawn_negotiator(&alice);

    a.join().await.unwrap();
    assert!(matches!(
        a.join().await.unwrap_err(),
        CallError::AlreadyJoined
    ));
    assert_eq!(alice.peers.created_count(), 1);
}

#[tokio::test]
async fn test_cancel_closes_session() {
    let network = TestNetwork::new();
    let alice = network.client("alice");
    let (a, task) = spawn_negotiator(&alice);
    a.join().await.unwrap();

    a.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(a.view().state, NegotiatorState::Closed);
    assert!(!network.store().has_documents_under("channel/general/call"));
}
