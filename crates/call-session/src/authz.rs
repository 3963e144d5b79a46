//! Channel authorization seam.
//!
//! Who may manage a channel is decided by the surrounding chat application.
//! The call session only asks.

use common::types::{ChannelId, UserId};
use std::collections::HashSet;

#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `uid` owns `channel` or holds its manage permission.
    async fn can_manage_channel(&self, channel: &ChannelId, uid: &UserId) -> bool;
}

/// Fixed set of managers, valid for every channel.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    managers: HashSet<UserId>,
}

impl StaticAuthorizer {
    #[must_use]
    pub fn new(managers: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            managers: managers.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl Authorizer for StaticAuthorizer {
    async fn can_manage_channel(&self, _channel: &ChannelId, uid: &UserId) -> bool {
        self.managers.contains(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_authorizer() {
        let authz = StaticAuthorizer::new([UserId::new("owner")]);
        let channel = ChannelId::new("c1");

        assert!(authz.can_manage_channel(&channel, &UserId::new("owner")).await);
        assert!(!authz.can_manage_channel(&channel, &UserId::new("bob")).await);
        assert!(!StaticAuthorizer::default()
            .can_manage_channel(&channel, &UserId::new("owner"))
            .await);
    }
}
