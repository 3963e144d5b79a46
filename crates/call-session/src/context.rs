//! Shared dependencies of the call actors.

use crate::authz::{Authorizer, StaticAuthorizer};
use crate::config::Config;
use crate::media::MediaBackend;
use crate::peer::{IceConfig, PeerFactory};
use crate::presence::LocalIdentity;
use crate::signaling::{SignalingChannel, DEFAULT_SESSION_DOC_ID};
use crate::store::DocumentStore;
use common::types::ChannelId;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on the `Negotiating` state.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default participant cap; two peers share one offer/answer pair.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 2;

/// Feature flags of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCapabilities {
    pub supports_kick: bool,
    pub max_participants: usize,
}

impl Default for CallCapabilities {
    fn default() -> Self {
        Self {
            supports_kick: true,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
        }
    }
}

/// Everything a negotiator or controller needs from the outside world.
#[derive(Clone)]
pub struct CallContext {
    pub identity: LocalIdentity,
    pub capabilities: CallCapabilities,
    pub ice: IceConfig,
    pub negotiation_timeout: Duration,
    pub session_doc_id: String,
    pub store: Arc<dyn DocumentStore>,
    pub peers: Arc<dyn PeerFactory>,
    pub media: Arc<dyn MediaBackend>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl CallContext {
    /// Context with default capabilities and an authorizer that grants no
    /// manage permission.
    #[must_use]
    pub fn new(
        identity: LocalIdentity,
        store: Arc<dyn DocumentStore>,
        peers: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaBackend>,
    ) -> Self {
        Self {
            identity,
            capabilities: CallCapabilities::default(),
            ice: IceConfig::default(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            session_doc_id: DEFAULT_SESSION_DOC_ID.to_string(),
            store,
            peers,
            media,
            authorizer: Arc::new(StaticAuthorizer::default()),
        }
    }

    /// Build from loaded configuration.
    #[must_use]
    pub fn from_config(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        peers: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaBackend>,
    ) -> Self {
        let identity = LocalIdentity {
            uid: config.user_id.clone(),
            display_name: config.display_name.clone(),
            avatar_url: config.avatar_url.clone(),
        };

        Self {
            capabilities: CallCapabilities {
                supports_kick: config.supports_kick,
                max_participants: config.max_participants,
            },
            ice: IceConfig {
                stun_urls: config.stun_urls.clone(),
            },
            negotiation_timeout: config.negotiation_timeout,
            session_doc_id: config.session_doc_id.clone(),
            authorizer: Arc::new(StaticAuthorizer::new(config.managers.iter().cloned())),
            ..Self::new(identity, store, peers, media)
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CallCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Signaling handle for `channel_id`'s session.
    #[must_use]
    pub fn signaling(&self, channel_id: ChannelId) -> SignalingChannel {
        SignalingChannel::open(Arc::clone(&self.store), channel_id, &self.session_doc_id)
    }
}
