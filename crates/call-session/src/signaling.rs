//! Typed access to a channel's call-session documents.
//!
//! [`SignalingChannel`] is the only component that knows the document layout
//! (see [`crate::model`]). Everything above it deals in [`CallSession`],
//! [`CandidateRecord`] and [`Participant`] values and typed change feeds.
//!
//! Feeds are built on [`DocumentStore::watch_collection`], so a feed opened
//! after entries already exist delivers those entries first and then only
//! what is appended afterwards. Each feed deduplicates by entry id, which
//! makes a re-delivered entry a no-op.

use crate::errors::{CallError, StoreError};
use crate::model::{
    CallSession, CandidateRecord, IceCandidate, Participant, ParticipantStatus, Role,
    SessionDescription,
};
use crate::observability::record_signaling_error;
use crate::store::{
    child_path, from_document, to_document, ChangeFeed, CollectionEvent, ConditionalWrite,
    Document, DocumentStore,
};
use chrono::Utc;
use common::types::{ChannelId, UserId};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Default fixed id of the call-session document.
pub const DEFAULT_SESSION_DOC_ID: &str = "active";

/// Sub-collection holding the roster.
const PARTICIPANTS: &str = "participants";

/// Outcome of [`SignalingChannel::publish_offer`].
#[derive(Debug, Clone, PartialEq)]
pub enum OfferPublish {
    Published,
    /// Another client published first; carries the winning session.
    AlreadyExists(CallSession),
}

/// Outcome of [`SignalingChannel::publish_answer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerPublish {
    Published,
    AlreadyAnswered,
}

/// How [`SignalingChannel::remove_self`] withdrew the roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalMode {
    Deleted,
    /// Deletion was not permitted; the entry was marked `left` instead.
    SoftLeft,
}

/// A change to the session document seen after joining.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    /// The answer, delivered at most once per feed.
    Answer(SessionDescription),
    /// The offer this client negotiated against was replaced or cleared.
    OfferReplaced,
    Deleted,
}

/// Handle to one channel's call-session documents.
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn DocumentStore>,
    channel_id: ChannelId,
    session_path: String,
}

fn timestamp() -> Value {
    json!(Utc::now())
}

fn fields(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

impl SignalingChannel {
    /// Open the session rooted at `channel/{channel_id}/call/{session_doc_id}`.
    ///
    /// Opening performs no I/O.
    #[must_use]
    pub fn open(store: Arc<dyn DocumentStore>, channel_id: ChannelId, session_doc_id: &str) -> Self {
        let session_path = format!("channel/{channel_id}/call/{session_doc_id}");
        Self {
            store,
            channel_id,
            session_path,
        }
    }

    #[must_use]
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    #[must_use]
    pub fn session_path(&self) -> &str {
        &self.session_path
    }

    fn candidate_log(&self, side: Role) -> String {
        child_path(&self.session_path, side.candidate_log())
    }

    fn participants(&self) -> String {
        child_path(&self.session_path, PARTICIPANTS)
    }

    fn participant_path(&self, uid: &UserId) -> String {
        child_path(&self.participants(), uid.as_str())
    }

    /// Current session document, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` on read or decode failure.
    pub async fn read_session(&self) -> Result<Option<CallSession>, CallError> {
        match self.store.get(&self.session_path).await? {
            Some(doc) => Ok(Some(from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Every roster entry, including non-active ones.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` on read failure. Undecodable entries are
    /// skipped.
    pub async fn read_roster(&self) -> Result<Vec<Participant>, CallError> {
        let entries = self.store.list(&self.participants()).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(id, doc)| decode_participant(&id, doc))
            .collect())
    }

    /// Publish the offer if the session has none.
    ///
    /// The write is atomic: of two clients racing on an empty session exactly
    /// one gets `Published`. Any answer left over from an earlier session is
    /// cleared with the same write.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the conditional write fails.
    #[instrument(skip_all, fields(channel_id = %self.channel_id))]
    pub async fn publish_offer(&self, offer: &SessionDescription) -> Result<OfferPublish, CallError> {
        let write = fields(json!({
            "offer": offer,
            "answer": Value::Null,
            "createdAt": timestamp(),
        }));

        match self
            .store
            .set_if_absent(&self.session_path, "offer", write)
            .await?
        {
            ConditionalWrite::Written => {
                info!(
                    target: "call.signaling",
                    channel_id = %self.channel_id,
                    by = %offer.by,
                    "Offer published"
                );
                Ok(OfferPublish::Published)
            }
            ConditionalWrite::Exists(doc) => {
                debug!(
                    target: "call.signaling",
                    channel_id = %self.channel_id,
                    "Offer already present, publish skipped"
                );
                Ok(OfferPublish::AlreadyExists(from_document(doc)?))
            }
        }
    }

    /// Publish the answer if the session has none.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the conditional write fails.
    #[instrument(skip_all, fields(channel_id = %self.channel_id))]
    pub async fn publish_answer(
        &self,
        answer: &SessionDescription,
    ) -> Result<AnswerPublish, CallError> {
        let write = fields(json!({ "answer": answer }));

        match self
            .store
            .set_if_absent(&self.session_path, "answer", write)
            .await?
        {
            ConditionalWrite::Written => {
                info!(
                    target: "call.signaling",
                    channel_id = %self.channel_id,
                    by = %answer.by,
                    "Answer published"
                );
                Ok(AnswerPublish::Published)
            }
            ConditionalWrite::Exists(_) => Ok(AnswerPublish::AlreadyAnswered),
        }
    }

    /// Append a candidate to `side`'s log.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the append fails.
    pub async fn append_candidate(
        &self,
        side: Role,
        candidate: &IceCandidate,
    ) -> Result<String, CallError> {
        let record = CandidateRecord {
            candidate: candidate.clone(),
            side,
            created_at: Utc::now(),
        };
        let id = self
            .store
            .append(&self.candidate_log(side), to_document(&record)?)
            .await?;
        Ok(id)
    }

    /// Watch the session document for an answer, offer replacement and
    /// deletion.
    ///
    /// `offer_sdp` is the offer this client negotiated against; any other
    /// offer, or none, reports [`SessionChange::OfferReplaced`].
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the subscription cannot be opened.
    pub async fn watch_session(
        &self,
        offer_sdp: String,
    ) -> Result<ChangeFeed<SessionChange>, CallError> {
        let feed = self.store.watch_document(&self.session_path).await?;
        let channel_id = self.channel_id.clone();
        let mut answered = false;

        Ok(feed.flat_map(move |doc| {
            let Some(doc) = doc else {
                return vec![SessionChange::Deleted];
            };
            let session: CallSession = match from_document(doc) {
                Ok(session) => session,
                Err(e) => {
                    warn!(
                        target: "call.signaling",
                        channel_id = %channel_id,
                        error = %e,
                        "Ignoring undecodable session document"
                    );
                    return Vec::new();
                }
            };

            if session.offer.as_ref().map(|offer| offer.sdp.as_str()) != Some(offer_sdp.as_str()) {
                return vec![SessionChange::OfferReplaced];
            }
            match session.answer {
                Some(answer) if !answered => {
                    answered = true;
                    vec![SessionChange::Answer(answer)]
                }
                _ => Vec::new(),
            }
        }))
    }

    /// Watch the decoded session document; `None` while it does not exist.
    /// Undecodable versions are skipped.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the subscription cannot be opened.
    pub async fn watch_session_state(&self) -> Result<ChangeFeed<Option<CallSession>>, CallError> {
        let feed = self.store.watch_document(&self.session_path).await?;
        let channel_id = self.channel_id.clone();

        Ok(feed.flat_map(move |doc| match doc {
            None => vec![None],
            Some(doc) => match from_document::<CallSession>(doc) {
                Ok(session) => vec![Some(session)],
                Err(e) => {
                    warn!(
                        target: "call.signaling",
                        channel_id = %channel_id,
                        error = %e,
                        "Ignoring undecodable session document"
                    );
                    Vec::new()
                }
            },
        }))
    }

    /// Watch for the answer only.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the subscription cannot be opened.
    pub async fn watch_answer(
        &self,
        offer_sdp: String,
    ) -> Result<ChangeFeed<SessionDescription>, CallError> {
        Ok(self
            .watch_session(offer_sdp)
            .await?
            .filter_map(|change| match change {
                SessionChange::Answer(answer) => Some(answer),
                _ => None,
            }))
    }

    /// Watch `side`'s candidate log.
    ///
    /// Entries present at subscription time are delivered first, then each
    /// newly appended entry exactly once.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the subscription cannot be opened.
    pub async fn watch_candidates(
        &self,
        side: Role,
    ) -> Result<ChangeFeed<CandidateRecord>, CallError> {
        let feed = self.store.watch_collection(&self.candidate_log(side)).await?;
        let mut seen: HashSet<String> = HashSet::new();

        Ok(feed.flat_map(move |event| {
            let entries = match event {
                CollectionEvent::Snapshot(entries) => entries,
                CollectionEvent::Added(id, doc) => vec![(id, doc)],
                // Logs are append-only; anything else is a purge.
                CollectionEvent::Modified(..) | CollectionEvent::Removed(_) => Vec::new(),
            };

            entries
                .into_iter()
                .filter(|(id, _)| seen.insert(id.clone()))
                .filter_map(|(id, doc)| match from_document::<CandidateRecord>(doc) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(
                            target: "call.signaling",
                            entry_id = %id,
                            error = %e,
                            "Ignoring undecodable candidate record"
                        );
                        None
                    }
                })
                .collect()
        }))
    }

    /// Watch the roster. Every delivery is the full roster, including
    /// non-active entries, ordered by uid.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the subscription cannot be opened.
    pub async fn watch_roster(&self) -> Result<ChangeFeed<Vec<Participant>>, CallError> {
        let feed = self.store.watch_collection(&self.participants()).await?;
        let mut roster: BTreeMap<String, Participant> = BTreeMap::new();

        Ok(feed.flat_map(move |event| {
            match event {
                CollectionEvent::Snapshot(entries) => {
                    roster = entries
                        .into_iter()
                        .filter_map(|(id, doc)| decode_participant(&id, doc).map(|p| (id, p)))
                        .collect();
                }
                CollectionEvent::Added(id, doc) | CollectionEvent::Modified(id, doc) => {
                    match decode_participant(&id, doc) {
                        Some(participant) => {
                            roster.insert(id, participant);
                        }
                        None => return Vec::new(),
                    }
                }
                CollectionEvent::Removed(id) => {
                    roster.remove(&id);
                }
            }
            vec![roster.values().cloned().collect()]
        }))
    }

    /// Create or overwrite this client's roster entry.
    ///
    /// Returns `false` when the stored entry already matched.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the merge fails.
    pub async fn upsert_self(&self, participant: &Participant) -> Result<bool, CallError> {
        let changed = self
            .store
            .merge(&self.participant_path(&participant.uid), to_document(participant)?)
            .await?;
        Ok(changed)
    }

    /// Update the device flags of an existing roster entry.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the merge fails.
    pub async fn update_media(
        &self,
        uid: &UserId,
        has_audio: bool,
        has_video: bool,
    ) -> Result<bool, CallError> {
        let update = fields(json!({
            "hasAudio": has_audio,
            "hasVideo": has_video,
            "updatedAt": timestamp(),
        }));
        Ok(self.store.merge(&self.participant_path(uid), update).await?)
    }

    /// Withdraw this client's roster entry.
    ///
    /// A store that refuses the delete gets a soft `left` update instead; that
    /// fallback is not an error.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if both the delete and the fallback fail.
    #[instrument(skip_all, fields(channel_id = %self.channel_id, uid = %uid))]
    pub async fn remove_self(&self, uid: &UserId) -> Result<RemovalMode, CallError> {
        let path = self.participant_path(uid);
        match self.store.delete(&path).await {
            Ok(()) => Ok(RemovalMode::Deleted),
            Err(e) if e.is_permission_denied() => {
                debug!(
                    target: "call.signaling",
                    channel_id = %self.channel_id,
                    uid = %uid,
                    "Roster delete denied, marking entry left"
                );
                self.store.merge(&path, left_fields()).await?;
                Ok(RemovalMode::SoftLeft)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Synchronous `left` mark for process teardown.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write fails.
    pub fn mark_left_blocking(&self, uid: &UserId) -> Result<(), StoreError> {
        self.store
            .merge_blocking(&self.participant_path(uid), left_fields())
    }

    /// Transition `uid`'s entry to `removed`, attributed to `by`.
    ///
    /// Returns `false` when `uid` has no active entry. Authorization is the
    /// caller's concern.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` on read or write failure.
    #[instrument(skip_all, fields(channel_id = %self.channel_id, uid = %uid, by = %by))]
    pub async fn mark_removed(&self, uid: &UserId, by: &UserId) -> Result<bool, CallError> {
        let path = self.participant_path(uid);
        let active = match self.store.get(&path).await? {
            Some(doc) => decode_participant(uid.as_str(), doc).is_some_and(|p| p.is_active()),
            None => false,
        };
        if !active {
            return Ok(false);
        }

        let now = timestamp();
        let update = fields(json!({
            "status": ParticipantStatus::Removed,
            "kickedBy": by,
            "removedAt": now,
            "updatedAt": now,
        }));
        self.store.merge(&path, update).await?;

        info!(
            target: "call.signaling",
            channel_id = %self.channel_id,
            uid = %uid,
            by = %by,
            "Participant marked removed"
        );
        Ok(true)
    }

    /// Empty the offer and answer slots and both candidate logs, keeping the
    /// roster, so that the next offer starts a fresh negotiation.
    ///
    /// The logs go first: anyone who sees the cleared slots and publishes a
    /// new offer appends to logs that no longer hold old candidates.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if a log or the session document cannot be
    /// written.
    #[instrument(skip_all, fields(channel_id = %self.channel_id))]
    pub async fn reset_session(&self) -> Result<(), CallError> {
        for side in [Role::Offerer, Role::Answerer] {
            self.store.delete_collection(&self.candidate_log(side)).await?;
        }
        let cleared = fields(json!({
            "offer": Value::Null,
            "answer": Value::Null,
        }));
        self.store.merge(&self.session_path, cleared).await?;

        info!(
            target: "call.signaling",
            channel_id = %self.channel_id,
            "Call session slots cleared for renegotiation"
        );
        Ok(())
    }

    /// Delete the session document, both candidate logs and the roster if no
    /// active participant remains.
    ///
    /// Best effort and not transactional: individual delete failures are
    /// logged and the remaining deletes still run. Returns whether a purge
    /// was attempted.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` only if the roster cannot be read.
    #[instrument(skip_all, fields(channel_id = %self.channel_id))]
    pub async fn purge_if_empty(&self) -> Result<bool, CallError> {
        let roster = self.read_roster().await?;
        if roster.iter().any(Participant::is_active) {
            return Ok(false);
        }

        if let Err(e) = self.store.delete(&self.session_path).await {
            self.purge_failed("session", &e);
        }
        for collection in [
            self.candidate_log(Role::Offerer),
            self.candidate_log(Role::Answerer),
            self.participants(),
        ] {
            if let Err(e) = self.store.delete_collection(&collection).await {
                self.purge_failed(&collection, &e);
            }
        }

        info!(
            target: "call.signaling",
            channel_id = %self.channel_id,
            "Empty call session purged"
        );
        Ok(true)
    }

    fn purge_failed(&self, what: &str, error: &StoreError) {
        record_signaling_error("purge");
        warn!(
            target: "call.signaling",
            channel_id = %self.channel_id,
            target_doc = %what,
            error = %error,
            "Best-effort purge step failed"
        );
    }
}

fn left_fields() -> Document {
    fields(json!({
        "status": ParticipantStatus::Left,
        "updatedAt": timestamp(),
    }))
}

fn decode_participant(id: &str, doc: Document) -> Option<Participant> {
    match from_document::<Participant>(doc) {
        Ok(participant) => Some(participant),
        Err(e) => {
            warn!(
                target: "call.signaling",
                entry_id = %id,
                error = %e,
                "Ignoring undecodable roster entry"
            );
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::model::SdpType;
    use crate::store::{MemoryStore, StoreOp};

    fn channel() -> (SignalingChannel, MemoryStore) {
        let store = MemoryStore::new();
        let signaling = SignalingChannel::open(
            Arc::new(store.clone()),
            ChannelId::new("c1"),
            DEFAULT_SESSION_DOC_ID,
        );
        (signaling, store)
    }

    fn participant(uid: &str) -> Participant {
        let now = Utc::now();
        Participant {
            uid: UserId::new(uid),
            display_name: uid.to_string(),
            avatar_url: None,
            has_audio: true,
            has_video: false,
            status: ParticipantStatus::Active,
            stream_id: Some(format!("stream-{uid}")),
            joined_at: now,
            updated_at: now,
            kicked_by: None,
            removed_at: None,
        }
    }

    fn candidate(descriptor: &str) -> IceCandidate {
        IceCandidate {
            candidate: descriptor.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn offer(sdp: &str, by: &str) -> SessionDescription {
        SessionDescription::new(SdpType::Offer, sdp, UserId::new(by))
    }

    #[tokio::test]
    async fn test_only_first_offer_is_published() {
        let (signaling, _store) = channel();

        assert_eq!(
            signaling.publish_offer(&offer("sdp-a", "alice")).await.unwrap(),
            OfferPublish::Published
        );
        match signaling.publish_offer(&offer("sdp-b", "bob")).await.unwrap() {
            OfferPublish::AlreadyExists(session) => {
                assert_eq!(session.offer.unwrap().sdp, "sdp-a");
            }
            OfferPublish::Published => panic!("second offer must not be published"),
        }

        let session = signaling.read_session().await.unwrap().unwrap();
        assert!(session.created_at.is_some());
        assert!(session.answer.is_none());
    }

    #[tokio::test]
    async fn test_only_first_answer_is_published() {
        let (signaling, _store) = channel();
        signaling.publish_offer(&offer("sdp-a", "alice")).await.unwrap();

        let answer = SessionDescription::new(SdpType::Answer, "ans", UserId::new("bob"));
        assert_eq!(
            signaling.publish_answer(&answer).await.unwrap(),
            AnswerPublish::Published
        );
        assert_eq!(
            signaling.publish_answer(&answer).await.unwrap(),
            AnswerPublish::AlreadyAnswered
        );
    }

    #[tokio::test]
    async fn test_answer_is_delivered_once() {
        let (signaling, store) = channel();
        signaling.publish_offer(&offer("sdp-a", "alice")).await.unwrap();
        let mut answers = signaling.watch_answer("sdp-a".to_string()).await.unwrap();

        let answer = SessionDescription::new(SdpType::Answer, "ans", UserId::new("bob"));
        signaling.publish_answer(&answer).await.unwrap();
        // Unrelated write to the same document
        store
            .merge(signaling.session_path(), fields(json!({"note": 1})))
            .await
            .unwrap();

        assert_eq!(answers.next().await.unwrap().sdp, "ans");
        let again = tokio::time::timeout(std::time::Duration::from_millis(50), answers.next()).await;
        assert!(again.is_err(), "answer must not be re-delivered");
    }

    #[tokio::test]
    async fn test_session_feed_reports_deletion_and_replacement() {
        let (signaling, store) = channel();
        signaling.publish_offer(&offer("sdp-a", "alice")).await.unwrap();

        let mut replaced = signaling.watch_session("sdp-other".to_string()).await.unwrap();
        assert_eq!(replaced.next().await, Some(SessionChange::OfferReplaced));

        let mut feed = signaling.watch_session("sdp-a".to_string()).await.unwrap();
        store.delete(signaling.session_path()).await.unwrap();
        assert_eq!(feed.next().await, Some(SessionChange::Deleted));
    }

    #[tokio::test]
    async fn test_candidate_feed_delivers_existing_then_new() {
        let (signaling, _store) = channel();
        signaling
            .append_candidate(Role::Offerer, &candidate("c1"))
            .await
            .unwrap();

        let mut feed = signaling.watch_candidates(Role::Offerer).await.unwrap();
        signaling
            .append_candidate(Role::Offerer, &candidate("c2"))
            .await
            .unwrap();
        signaling
            .append_candidate(Role::Answerer, &candidate("other-side"))
            .await
            .unwrap();

        let first = feed.next().await.unwrap();
        let second = feed.next().await.unwrap();
        assert_eq!(first.candidate.candidate, "c1");
        assert_eq!(second.candidate.candidate, "c2");
        assert_eq!(second.side, Role::Offerer);
    }

    #[tokio::test]
    async fn test_roster_feed_delivers_full_roster() {
        let (signaling, _store) = channel();
        signaling.upsert_self(&participant("alice")).await.unwrap();

        let mut feed = signaling.watch_roster().await.unwrap();
        assert_eq!(feed.next().await.unwrap().len(), 1);

        signaling.upsert_self(&participant("bob")).await.unwrap();
        let roster = feed.next().await.unwrap();
        assert_eq!(roster.len(), 2);

        signaling.remove_self(&UserId::new("alice")).await.unwrap();
        let roster = feed.next().await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.first().unwrap().uid, UserId::new("bob"));
    }

    #[tokio::test]
    async fn test_repeated_upsert_is_a_no_op() {
        let (signaling, store) = channel();
        let alice = participant("alice");

        assert!(signaling.upsert_self(&alice).await.unwrap());
        let writes = store.write_count();
        assert!(!signaling.upsert_self(&alice).await.unwrap());
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_remove_self_falls_back_to_soft_left() {
        let (signaling, store) = channel();
        signaling.upsert_self(&participant("alice")).await.unwrap();
        store.deny(StoreOp::Delete, signaling.participants());

        let mode = signaling.remove_self(&UserId::new("alice")).await.unwrap();
        assert_eq!(mode, RemovalMode::SoftLeft);

        let roster = signaling.read_roster().await.unwrap();
        assert_eq!(roster.first().unwrap().status, ParticipantStatus::Left);
    }

    #[tokio::test]
    async fn test_mark_removed_records_actor() {
        let (signaling, _store) = channel();
        signaling.upsert_self(&participant("bob")).await.unwrap();

        assert!(signaling
            .mark_removed(&UserId::new("bob"), &UserId::new("owner"))
            .await
            .unwrap());
        assert!(!signaling
            .mark_removed(&UserId::new("ghost"), &UserId::new("owner"))
            .await
            .unwrap());

        let bob = signaling.read_roster().await.unwrap().remove(0);
        assert_eq!(bob.status, ParticipantStatus::Removed);
        assert_eq!(bob.kicked_by, Some(UserId::new("owner")));
        assert!(bob.removed_at.is_some());
    }

    #[tokio::test]
    async fn test_purge_only_when_roster_empty() {
        let (signaling, store) = channel();
        signaling.publish_offer(&offer("sdp-a", "alice")).await.unwrap();
        signaling
            .append_candidate(Role::Offerer, &candidate("c1"))
            .await
            .unwrap();
        signaling.upsert_self(&participant("alice")).await.unwrap();

        assert!(!signaling.purge_if_empty().await.unwrap());
        assert!(signaling.read_session().await.unwrap().is_some());

        signaling.remove_self(&UserId::new("alice")).await.unwrap();
        assert!(signaling.purge_if_empty().await.unwrap());
        assert!(signaling.read_session().await.unwrap().is_none());
        assert!(!store.has_documents_under(signaling.session_path()));
    }

    #[tokio::test]
    async fn test_reset_clears_slots_and_logs_but_keeps_roster() {
        let (signaling, _store) = channel();
        signaling.upsert_self(&participant("alice")).await.unwrap();
        signaling.publish_offer(&offer("sdp-a", "alice")).await.unwrap();
        let answer = SessionDescription::new(SdpType::Answer, "ans", UserId::new("bob"));
        signaling.publish_answer(&answer).await.unwrap();
        signaling
            .append_candidate(Role::Answerer, &candidate("c-bob"))
            .await
            .unwrap();
        let mut state = signaling.watch_session_state().await.unwrap();
        assert!(state.next().await.unwrap().unwrap().answer.is_some());

        signaling.reset_session().await.unwrap();

        let session = signaling.read_session().await.unwrap().unwrap();
        assert!(session.is_empty());
        assert!(session.answer.is_none());
        assert_eq!(state.next().await.unwrap(), Some(session));
        assert_eq!(signaling.read_roster().await.unwrap().len(), 1);

        let mut candidates = signaling.watch_candidates(Role::Answerer).await.unwrap();
        signaling
            .append_candidate(Role::Answerer, &candidate("c-carol"))
            .await
            .unwrap();
        assert_eq!(candidates.next().await.unwrap().candidate.candidate, "c-carol");

        // The cleared slot is open to a new offer.
        assert_eq!(
            signaling.publish_offer(&offer("sdp-c", "carol")).await.unwrap(),
            OfferPublish::Published
        );
    }

    #[tokio::test]
    async fn test_mark_left_blocking() {
        let (signaling, _store) = channel();
        signaling.upsert_self(&participant("alice")).await.unwrap();

        signaling
            .mark_left_blocking(&UserId::new("alice"))
            .unwrap();

        let roster = signaling.read_roster().await.unwrap();
        assert!(!roster.first().unwrap().is_active());
    }
}
