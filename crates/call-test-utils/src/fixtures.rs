//! Pre-wired clients sharing one in-memory document store.

use crate::fake_media::FakeMediaBackend;
use crate::fake_peer::FakePeerFactory;
use call_session::authz::StaticAuthorizer;
use call_session::context::{CallCapabilities, CallContext};
use call_session::presence::LocalIdentity;
use call_session::store::MemoryStore;
use common::types::{ChannelId, UserId};
use std::sync::Arc;
use std::time::Duration;

/// Channel used by tests that need only one.
pub const TEST_CHANNEL: &str = "general";

/// A shared store plus the moderators every client's authorizer knows.
#[derive(Debug, Clone, Default)]
pub struct TestNetwork {
    store: MemoryStore,
    managers: Vec<UserId>,
}

impl TestNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant manage permission to `uid` for clients created afterwards.
    #[must_use]
    pub fn with_manager(mut self, uid: &str) -> Self {
        self.managers.push(UserId::new(uid));
        self
    }

    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    #[must_use]
    pub fn channel() -> ChannelId {
        ChannelId::new(TEST_CHANNEL)
    }

    /// New client named `uid` with its own fake devices and connections.
    #[must_use]
    pub fn client(&self, uid: &str) -> TestClient {
        self.client_with_peers(uid, FakePeerFactory::new())
    }

    #[must_use]
    pub fn client_with_peers(&self, uid: &str, peers: FakePeerFactory) -> TestClient {
        let media = FakeMediaBackend::new();
        let identity = LocalIdentity::new(UserId::new(uid), uid.to_uppercase());
        let ctx = CallContext::new(
            identity,
            Arc::new(self.store.clone()),
            Arc::new(peers.clone()),
            Arc::new(media.clone()),
        )
        .with_authorizer(Arc::new(StaticAuthorizer::new(self.managers.iter().cloned())));

        TestClient {
            uid: UserId::new(uid),
            ctx,
            peers,
            media,
        }
    }
}

/// Everything one simulated client needs.
#[derive(Clone)]
pub struct TestClient {
    pub uid: UserId,
    pub ctx: CallContext,
    pub peers: FakePeerFactory,
    pub media: FakeMediaBackend,
}

impl TestClient {
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CallCapabilities) -> Self {
        self.ctx = self.ctx.with_capabilities(capabilities);
        self
    }

    #[must_use]
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.ctx = self.ctx.with_negotiation_timeout(timeout);
        self
    }
}
