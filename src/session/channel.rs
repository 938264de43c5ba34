//! Named broadcast channels.
//!
//! A channel is a store set of member tuples plus, per bound user, a
//! reverse index of channel names. Members carry their owning gateway so a
//! channel broadcast can group deliveries per node without a session
//! lookup per member.

use crate::session::directory::SessionDirectory;
use crate::session::session::Session;
use crate::store::keys::{channel_key, user_channels_key};
use crate::store::{SharedStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// One channel membership entry, serialized as the set member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMember {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<String>,
}

impl ChannelMember {
    pub fn from_session(session: &Session) -> Self {
        Self {
            id: session.id().to_string(),
            uid: session.uid().map(str::to_string),
            frontend: session.frontend().map(str::to_string),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct ChannelDirectory {
    store: Arc<dyn SharedStore>,
    sessions: SessionDirectory,
}

impl ChannelDirectory {
    pub fn new(store: Arc<dyn SharedStore>, sessions: SessionDirectory) -> Self {
        Self { store, sessions }
    }

    /// Add a member. The member set and the user's reverse index are kept
    /// in lockstep; an unbound member only touches the set.
    pub async fn add(&self, name: &str, member: &ChannelMember) -> Result<(), ChannelError> {
        let encoded = encode_member(member);
        self.store.set_add(&channel_key(name), &encoded).await?;
        if let Some(uid) = &member.uid {
            self.store.set_add(&user_channels_key(uid), name).await?;
        }
        Ok(())
    }

    /// Remove a member, mirroring [`add`].
    pub async fn leave(&self, name: &str, member: &ChannelMember) -> Result<(), ChannelError> {
        let encoded = encode_member(member);
        self.store.set_remove(&channel_key(name), &encoded).await?;
        if let Some(uid) = &member.uid {
            self.store.set_remove(&user_channels_key(uid), name).await?;
        }
        Ok(())
    }

    /// Current members. Entries that fail to decode are skipped with a
    /// warning rather than poisoning the whole read.
    pub async fn members(&self, name: &str) -> Result<Vec<ChannelMember>, ChannelError> {
        let raw = self.store.set_members(&channel_key(name)).await?;
        let mut members = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<ChannelMember>(&entry) {
                Ok(member) => members.push(member),
                Err(err) => warn!(channel = %name, error = %err, "skipping malformed member"),
            }
        }
        Ok(members)
    }

    /// Channels a user currently belongs to.
    pub async fn channels(&self, uid: &str) -> Result<Vec<String>, ChannelError> {
        Ok(self.store.set_members(&user_channels_key(uid)).await?)
    }

    /// Deliver `{event, body}` to every member, grouped by owning gateway.
    /// A node that fails only loses its own members; delivery continues
    /// elsewhere. Returns the ids that were not reached.
    pub async fn broadcast(
        &self,
        name: &str,
        event: &str,
        message: &str,
    ) -> Result<Vec<String>, ChannelError> {
        let mut by_owner: HashMap<String, Vec<String>> = HashMap::new();
        let mut failed = Vec::new();
        for member in self.members(name).await? {
            match member.frontend {
                Some(owner) => by_owner.entry(owner).or_default().push(member.id),
                None => failed.push(member.id),
            }
        }
        for (owner, ids) in by_owner {
            failed.extend(self.sessions.deliver_to(&owner, &ids, event, message).await);
        }
        Ok(failed)
    }
}

fn encode_member(member: &ChannelMember) -> String {
    // Field order is fixed by the struct, so equal members always encode
    // to the same set entry.
    serde_json::to_string(member).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::registry::ClusterRegistry;
    use crate::rpc::{Capability, RpcChannel, RpcConnector, RpcError, RpcConnectionCache};
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;

    struct NoConnector;

    #[async_trait]
    impl RpcConnector for NoConnector {
        async fn connect(
            &self,
            descriptor: &crate::cluster::registry::ServerDescriptor,
            _capability: Capability,
        ) -> Result<Arc<dyn RpcChannel>, RpcError> {
            Err(RpcError::Connect {
                addr: descriptor.rpc_addr(),
                reason: "unreachable".into(),
            })
        }
    }

    fn channels() -> ChannelDirectory {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let registry = ClusterRegistry::new(Arc::clone(&store));
        let cache = RpcConnectionCache::new(Arc::new(NoConnector));
        let sessions =
            SessionDirectory::new(Arc::clone(&store), registry, cache, "gate-1", None);
        ChannelDirectory::new(store, sessions)
    }

    fn member(id: &str, uid: Option<&str>) -> ChannelMember {
        ChannelMember {
            id: id.to_string(),
            uid: uid.map(str::to_string),
            frontend: Some("gate-1".to_string()),
        }
    }

    #[tokio::test]
    async fn membership_and_reverse_index_stay_in_lockstep() {
        let channels = channels();
        let m = member("s-1", Some("u-1"));
        channels.add("room", &m).await.unwrap();
        assert_eq!(channels.members("room").await.unwrap(), vec![m.clone()]);
        assert_eq!(
            channels.channels("u-1").await.unwrap(),
            vec!["room".to_string()]
        );

        channels.leave("room", &m).await.unwrap();
        assert!(channels.members("room").await.unwrap().is_empty());
        assert!(channels.channels("u-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_is_idempotent_per_member() {
        let channels = channels();
        let m = member("s-1", None);
        channels.add("room", &m).await.unwrap();
        channels.add("room", &m).await.unwrap();
        assert_eq!(channels.members("room").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_reports_unplaced_members() {
        let channels = channels();
        let mut orphan = member("s-9", None);
        orphan.frontend = None;
        channels.add("room", &orphan).await.unwrap();
        let failed = channels.broadcast("room", "notice", "{}").await.unwrap();
        assert_eq!(failed, vec!["s-9".to_string()]);
    }
}
