//! Lazy RPC handle cache.
//!
//! Handles are created on first use and reused until a transport failure
//! or an eviction from the health monitor removes them. There is no
//! background reconnect; the next caller pays the connect cost.

use super::{Capability, RpcChannel, RpcConnector, RpcError};
use crate::cluster::registry::ServerDescriptor;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone)]
pub struct RpcConnectionCache {
    connector: Arc<dyn RpcConnector>,
    handles: Arc<Mutex<HashMap<(String, Capability), Arc<dyn RpcChannel>>>>,
}

impl RpcConnectionCache {
    pub fn new(connector: Arc<dyn RpcConnector>) -> Self {
        Self {
            connector,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the cached handle for `(descriptor.id, capability)`,
    /// connecting first when none exists. The map lock is never held across
    /// the connect, so a stalled peer cannot block lookups for other nodes;
    /// two racing callers may both connect, the first insert wins.
    pub async fn get(
        &self,
        descriptor: &ServerDescriptor,
        capability: Capability,
    ) -> Result<Arc<dyn RpcChannel>, RpcError> {
        let key = (descriptor.id.clone(), capability);
        if let Some(handle) = self.handles.lock().await.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let handle = self.connector.connect(descriptor, capability).await?;
        let mut handles = self.handles.lock().await;
        match handles.entry(key) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                debug!(node = %descriptor.id, capability = %capability, "rpc handle opened");
                slot.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    /// Drops one capability handle for a node.
    pub async fn evict(&self, node_id: &str, capability: Capability) {
        let mut handles = self.handles.lock().await;
        if handles.remove(&(node_id.to_string(), capability)).is_some() {
            debug!(node = %node_id, capability = %capability, "rpc handle evicted");
        }
    }

    /// Drops every handle for a node, typically on cluster departure.
    pub async fn evict_node(&self, node_id: &str) {
        let mut handles = self.handles.lock().await;
        handles.retain(|(id, _), _| id != node_id);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcRequest, RpcResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullChannel;

    #[async_trait]
    impl RpcChannel for NullChannel {
        async fn call(&self, _request: RpcRequest) -> Result<RpcResponse, RpcError> {
            Ok(RpcResponse::Ack { success: true })
        }
    }

    struct CountingConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl RpcConnector for CountingConnector {
        async fn connect(
            &self,
            _descriptor: &ServerDescriptor,
            _capability: Capability,
        ) -> Result<Arc<dyn RpcChannel>, RpcError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullChannel))
        }
    }

    fn descriptor(id: &str) -> ServerDescriptor {
        ServerDescriptor::new(id, "127.0.0.1", "localhost", 9000, "chat", "1.0.0")
    }

    #[tokio::test]
    async fn handles_are_reused_until_evicted() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
        });
        let cache = RpcConnectionCache::new(connector.clone());
        let node = descriptor("chat-1");

        cache.get(&node, Capability::Backward).await.unwrap();
        cache.get(&node, Capability::Backward).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        cache.evict("chat-1", Capability::Backward).await;
        cache.get(&node, Capability::Backward).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn evict_node_clears_every_capability() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
        });
        let cache = RpcConnectionCache::new(connector);
        let node = descriptor("chat-1");

        cache.get(&node, Capability::Backward).await.unwrap();
        cache.get(&node, Capability::Monitor).await.unwrap();
        assert_eq!(cache.len().await, 2);

        cache.evict_node("chat-1").await;
        assert_eq!(cache.len().await, 0);
    }

    struct StallingConnector;

    #[async_trait]
    impl RpcConnector for StallingConnector {
        async fn connect(
            &self,
            descriptor: &ServerDescriptor,
            _capability: Capability,
        ) -> Result<Arc<dyn RpcChannel>, RpcError> {
            if descriptor.id == "stuck-1" {
                std::future::pending::<()>().await;
            }
            Ok(Arc::new(NullChannel))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connect_does_not_block_other_lookups() {
        let cache = RpcConnectionCache::new(Arc::new(StallingConnector));

        let stuck = cache.clone();
        let node = descriptor("stuck-1");
        tokio::spawn(async move {
            let _ = stuck.get(&node, Capability::Backward).await;
        });
        tokio::task::yield_now().await;

        let live = descriptor("live-1");
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            cache.get(&live, Capability::Backward),
        )
        .await
        .expect("lookup stalled behind an unrelated connect")
        .unwrap();
    }
}
