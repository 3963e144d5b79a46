//! Roster presence for the local client.
//!
//! [`PresenceTracker`] keeps this client's roster entry in step with its
//! local device state and turns each roster delivery into a
//! [`RosterDelta`]: who joined, who left, and whether this client itself was
//! removed by a moderator.

use crate::authz::Authorizer;
use crate::errors::CallError;
use crate::model::{Participant, ParticipantStatus};
use crate::signaling::{RemovalMode, SignalingChannel};
use chrono::{DateTime, Utc};
use common::types::UserId;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Who this client is on the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub uid: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl LocalIdentity {
    #[must_use]
    pub fn new(uid: UserId, display_name: impl Into<String>) -> Self {
        Self {
            uid,
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

/// Changes observed in one roster delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDelta {
    pub joined: Vec<UserId>,
    pub left: Vec<UserId>,
    /// Set when this client's own entry was moved to `removed` during the
    /// current membership; carries the acting moderator.
    pub removed_by: Option<UserId>,
}

pub struct PresenceTracker {
    signaling: SignalingChannel,
    identity: LocalIdentity,
    stream_id: String,
    joined_at: Option<DateTime<Utc>>,
    /// Last published `(has_audio, has_video)`.
    published: Option<(bool, bool)>,
    others: BTreeSet<UserId>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(signaling: SignalingChannel, identity: LocalIdentity, stream_id: String) -> Self {
        Self {
            signaling,
            identity,
            stream_id,
            joined_at: None,
            published: None,
            others: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn uid(&self) -> &UserId {
        &self.identity.uid
    }

    #[must_use]
    pub fn joined_at(&self) -> Option<DateTime<Utc>> {
        self.joined_at
    }

    /// Write a fresh `active` entry. Clears any earlier `kickedBy` /
    /// `removedAt`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the write fails.
    pub async fn publish(&mut self, has_audio: bool, has_video: bool) -> Result<(), CallError> {
        let now = Utc::now();
        let entry = Participant {
            uid: self.identity.uid.clone(),
            display_name: self.identity.display_name.clone(),
            avatar_url: self.identity.avatar_url.clone(),
            has_audio,
            has_video,
            status: ParticipantStatus::Active,
            stream_id: Some(self.stream_id.clone()),
            joined_at: now,
            updated_at: now,
            kicked_by: None,
            removed_at: None,
        };

        self.signaling.upsert_self(&entry).await?;
        self.joined_at = Some(now);
        self.published = Some((has_audio, has_video));

        info!(
            target: "call.presence",
            channel_id = %self.signaling.channel_id(),
            uid = %self.identity.uid,
            has_audio,
            has_video,
            "Roster entry published"
        );
        Ok(())
    }

    /// Push new device flags. Returns `false` (and writes nothing) when they
    /// match what was last published or nothing was published yet.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the write fails.
    pub async fn update_media(&mut self, has_audio: bool, has_video: bool) -> Result<bool, CallError> {
        match self.published {
            None => return Ok(false),
            Some(current) if current == (has_audio, has_video) => return Ok(false),
            Some(_) => {}
        }

        self.signaling
            .update_media(&self.identity.uid, has_audio, has_video)
            .await?;
        self.published = Some((has_audio, has_video));

        debug!(
            target: "call.presence",
            uid = %self.identity.uid,
            has_audio,
            has_video,
            "Roster media flags updated"
        );
        Ok(true)
    }

    /// Remove or soft-mark this client's entry.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if neither removal path succeeds.
    pub async fn withdraw(&mut self) -> Result<RemovalMode, CallError> {
        let mode = self.signaling.remove_self(&self.identity.uid).await?;
        self.published = None;

        info!(
            target: "call.presence",
            channel_id = %self.signaling.channel_id(),
            uid = %self.identity.uid,
            mode = ?mode,
            "Roster entry withdrawn"
        );
        Ok(mode)
    }

    /// Diff a full roster delivery against the previous one.
    pub fn observe(&mut self, roster: &[Participant]) -> RosterDelta {
        let mut delta = RosterDelta::default();

        let current: BTreeSet<UserId> = roster
            .iter()
            .filter(|p| p.is_active() && p.uid != self.identity.uid)
            .map(|p| p.uid.clone())
            .collect();
        delta.joined = current.difference(&self.others).cloned().collect();
        delta.left = self.others.difference(&current).cloned().collect();
        self.others = current;

        if let Some(own) = roster.iter().find(|p| p.uid == self.identity.uid) {
            delta.removed_by = self.removal_of(own);
        }

        for uid in &delta.joined {
            debug!(target: "call.presence", uid = %uid, "Participant joined");
        }
        for uid in &delta.left {
            debug!(target: "call.presence", uid = %uid, "Participant left");
        }
        delta
    }

    /// A `removed` entry counts once this client has published. Publishing
    /// overwrites any earlier removal and the roster feed is opened after
    /// it, so every `removed` seen here belongs to the current membership.
    /// `removedAt` is written by the moderator's clock and is not compared.
    fn removal_of(&self, own: &Participant) -> Option<UserId> {
        if own.status != ParticipantStatus::Removed || self.joined_at.is_none() {
            return None;
        }

        let by = own.kicked_by.clone().unwrap_or_else(|| UserId::new("unknown"));
        warn!(
            target: "call.presence",
            uid = %self.identity.uid,
            by = %by,
            "Removed from call by moderator"
        );
        Some(by)
    }
}

/// Active entries only, which is what the visible roster shows.
#[must_use]
pub fn active_roster(roster: &[Participant]) -> Vec<Participant> {
    roster.iter().filter(|p| p.is_active()).cloned().collect()
}

/// Move `target` to `removed` on behalf of `actor`.
///
/// Returns `false` when `target` is not an active participant.
///
/// # Errors
///
/// - `CallError::KickUnsupported` when the session has kick disabled
/// - `CallError::PermissionDenied` when `actor` may not manage the channel or
///   targets itself
/// - `CallError::Store` on write failure
pub async fn kick(
    signaling: &SignalingChannel,
    authorizer: &dyn Authorizer,
    supports_kick: bool,
    actor: &UserId,
    target: &UserId,
) -> Result<bool, CallError> {
    if !supports_kick {
        return Err(CallError::KickUnsupported);
    }
    if actor == target {
        return Err(CallError::PermissionDenied(
            "You cannot remove yourself".to_string(),
        ));
    }
    if !authorizer
        .can_manage_channel(signaling.channel_id(), actor)
        .await
    {
        warn!(
            target: "call.presence",
            channel_id = %signaling.channel_id(),
            actor = %actor,
            target_uid = %target,
            "Kick rejected: actor lacks manage permission"
        );
        return Err(CallError::PermissionDenied(
            "You do not have permission to remove participants".to_string(),
        ));
    }

    signaling.mark_removed(target, actor).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::authz::StaticAuthorizer;
    use crate::signaling::DEFAULT_SESSION_DOC_ID;
    use crate::store::{DocumentStore, MemoryStore};
    use common::types::ChannelId;
    use std::sync::Arc;

    fn signaling(store: &MemoryStore) -> SignalingChannel {
        SignalingChannel::open(
            Arc::new(store.clone()) as Arc<dyn DocumentStore>,
            ChannelId::new("c1"),
            DEFAULT_SESSION_DOC_ID,
        )
    }

    fn tracker(store: &MemoryStore, uid: &str) -> PresenceTracker {
        PresenceTracker::new(
            signaling(store),
            LocalIdentity::new(UserId::new(uid), uid),
            format!("stream-{uid}"),
        )
    }

    #[tokio::test]
    async fn test_publish_then_update_skips_unchanged_flags() {
        let store = MemoryStore::new();
        let mut alice = tracker(&store, "alice");

        assert!(!alice.update_media(true, true).await.unwrap());

        alice.publish(true, false).await.unwrap();
        let writes = store.write_count();
        assert!(!alice.update_media(true, false).await.unwrap());
        assert_eq!(store.write_count(), writes);

        assert!(alice.update_media(true, true).await.unwrap());
        let roster = signaling(&store).read_roster().await.unwrap();
        let entry = roster.first().unwrap();
        assert!(entry.has_video);
        assert_eq!(entry.stream_id.as_deref(), Some("stream-alice"));
    }

    #[tokio::test]
    async fn test_observe_reports_joins_and_leaves() {
        let store = MemoryStore::new();
        let mut alice = tracker(&store, "alice");
        let mut bob = tracker(&store, "bob");
        alice.publish(true, false).await.unwrap();
        bob.publish(true, false).await.unwrap();

        let roster = signaling(&store).read_roster().await.unwrap();
        let delta = alice.observe(&roster);
        assert_eq!(delta.joined, vec![UserId::new("bob")]);
        assert!(delta.left.is_empty());
        assert!(delta.removed_by.is_none());

        bob.withdraw().await.unwrap();
        let roster = signaling(&store).read_roster().await.unwrap();
        let delta = alice.observe(&roster);
        assert_eq!(delta.left, vec![UserId::new("bob")]);
    }

    #[tokio::test]
    async fn test_kick_marks_removal_for_target() {
        let store = MemoryStore::new();
        let mut bob = tracker(&store, "bob");
        bob.publish(true, true).await.unwrap();
        let authz = StaticAuthorizer::new([UserId::new("owner")]);

        let kicked = kick(
            &signaling(&store),
            &authz,
            true,
            &UserId::new("owner"),
            &UserId::new("bob"),
        )
        .await
        .unwrap();
        assert!(kicked);

        let roster = signaling(&store).read_roster().await.unwrap();
        assert_eq!(
            bob.observe(&roster).removed_by,
            Some(UserId::new("owner"))
        );
    }

    #[tokio::test]
    async fn test_kick_requires_capability_and_permission() {
        let store = MemoryStore::new();
        let authz = StaticAuthorizer::new([UserId::new("owner")]);
        let channel = signaling(&store);

        let err = kick(&channel, &authz, false, &UserId::new("owner"), &UserId::new("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::KickUnsupported));

        let err = kick(&channel, &authz, true, &UserId::new("mallory"), &UserId::new("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::PermissionDenied(_)));

        let err = kick(&channel, &authz, true, &UserId::new("owner"), &UserId::new("owner"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_rejoin_clears_previous_removal() {
        let store = MemoryStore::new();
        let authz = StaticAuthorizer::new([UserId::new("owner")]);
        let mut bob = tracker(&store, "bob");
        bob.publish(true, false).await.unwrap();
        kick(&signaling(&store), &authz, true, &UserId::new("owner"), &UserId::new("bob"))
            .await
            .unwrap();

        bob.publish(true, false).await.unwrap();

        let fresh = signaling(&store).read_roster().await.unwrap();
        let own = fresh.first().unwrap();
        assert!(own.is_active());
        assert!(own.kicked_by.is_none());
        assert!(own.removed_at.is_none());
        assert!(bob.observe(&fresh).removed_by.is_none());
    }

    #[tokio::test]
    async fn test_removal_with_lagging_moderator_clock_counts() {
        let store = MemoryStore::new();
        let mut bob = tracker(&store, "bob");
        bob.publish(true, false).await.unwrap();

        // Moderator clock a minute behind this client's.
        let removed_at = Utc::now() - chrono::Duration::seconds(60);
        let update = serde_json::json!({
            "status": "removed",
            "kickedBy": "owner",
            "removedAt": removed_at,
        });
        store
            .merge(
                "channel/c1/call/active/participants/bob",
                update.as_object().unwrap().clone(),
            )
            .await
            .unwrap();

        let roster = signaling(&store).read_roster().await.unwrap();
        assert_eq!(
            bob.observe(&roster).removed_by,
            Some(UserId::new("owner"))
        );
    }

    #[tokio::test]
    async fn test_removal_before_publish_is_ignored() {
        let store = MemoryStore::new();
        let authz = StaticAuthorizer::new([UserId::new("owner")]);
        let mut bob = tracker(&store, "bob");
        bob.publish(true, false).await.unwrap();
        kick(&signaling(&store), &authz, true, &UserId::new("owner"), &UserId::new("bob"))
            .await
            .unwrap();
        let roster = signaling(&store).read_roster().await.unwrap();

        let mut fresh = tracker(&store, "bob");
        assert!(fresh.observe(&roster).removed_by.is_none());
    }

    #[test]
    fn test_active_roster_hides_inactive_entries() {
        let now = Utc::now();
        let entry = |uid: &str, status| Participant {
            uid: UserId::new(uid),
            display_name: uid.to_string(),
            avatar_url: None,
            has_audio: false,
            has_video: false,
            status,
            stream_id: None,
            joined_at: now,
            updated_at: now,
            kicked_by: None,
            removed_at: None,
        };
        let roster = vec![
            entry("a", ParticipantStatus::Active),
            entry("b", ParticipantStatus::Left),
            entry("c", ParticipantStatus::Removed),
        ];

        let active = active_roster(&roster);
        assert_eq!(active.len(), 1);
        assert_eq!(active.first().unwrap().uid, UserId::new("a"));
    }
}
