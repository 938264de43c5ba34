//! Cluster membership and health eviction behavior.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trellis::cluster::health::HealthMonitor;
use trellis::cluster::registry::{ClusterRegistry, ServerDescriptor};
use trellis::rpc::{
    Capability, RpcChannel, RpcConnectionCache, RpcConnector, RpcError, RpcRequest, RpcResponse,
    StateReply,
};
use trellis::store::keys::CHANNEL_OFFLINE;
use trellis::store::memory::MemoryStore;
use trellis::store::SharedStore;

fn descriptor(id: &str, node_type: &str) -> ServerDescriptor {
    ServerDescriptor::new(id, "127.0.0.1", "localhost", 9000, node_type, "1.0.0")
}

struct HealthyChannel {
    id: String,
    dead: Arc<AtomicBool>,
}

#[async_trait]
impl RpcChannel for HealthyChannel {
    async fn call(&self, _request: RpcRequest) -> Result<RpcResponse, RpcError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("peer went away".into()));
        }
        Ok(RpcResponse::State(StateReply {
            id: self.id.clone(),
            memory: 1024,
            free: 512,
            loadavg: vec![0.1, 0.1, 0.1],
        }))
    }
}

/// Connector whose targets can be flipped dead at runtime.
struct SwitchableConnector {
    dead: Arc<AtomicBool>,
}

#[async_trait]
impl RpcConnector for SwitchableConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        _capability: Capability,
    ) -> Result<Arc<dyn RpcChannel>, RpcError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(RpcError::Connect {
                addr: descriptor.rpc_addr(),
                reason: "connection refused".into(),
            });
        }
        Ok(Arc::new(HealthyChannel {
            id: descriptor.id.clone(),
            dead: Arc::clone(&self.dead),
        }))
    }
}

#[tokio::test]
async fn three_consecutive_failures_evict_a_peer_exactly_once() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = ClusterRegistry::new(Arc::clone(&store));
    let connector = Arc::new(SwitchableConnector {
        dead: Arc::new(AtomicBool::new(false)),
    });
    let cache = RpcConnectionCache::new(connector.clone());

    registry.register(&descriptor("gate-1", "gate")).await.unwrap();
    registry.register(&descriptor("chat-1", "chat")).await.unwrap();

    let mut offline = store.subscribe(&[CHANNEL_OFFLINE]).await.unwrap();
    let mut monitor = HealthMonitor::new(
        registry.clone(),
        cache,
        "gate-1",
        Duration::from_secs(5),
    );

    // Healthy warm-up cycle so first-cycle eviction does not apply.
    monitor.poll_once(true).await;
    assert!(registry.contains("chat-1"));

    connector.dead.store(true, Ordering::SeqCst);
    monitor.poll_once(false).await;
    assert!(registry.contains("chat-1"));
    monitor.poll_once(false).await;
    assert!(registry.contains("chat-1"));
    monitor.poll_once(false).await;
    assert!(!registry.contains("chat-1"));

    // Exactly one offline announcement for the evicted peer.
    let event = offline.recv().await.unwrap();
    let gone: ServerDescriptor = serde_json::from_str(&event.payload).unwrap();
    assert_eq!(gone.id, "chat-1");
    monitor.poll_once(false).await;
    assert!(offline.try_recv().is_err());
}

#[tokio::test]
async fn recovery_between_failures_resets_the_counter() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = ClusterRegistry::new(Arc::clone(&store));
    let connector = Arc::new(SwitchableConnector {
        dead: Arc::new(AtomicBool::new(false)),
    });
    let cache = RpcConnectionCache::new(connector.clone());

    registry.register(&descriptor("chat-1", "chat")).await.unwrap();
    let mut monitor = HealthMonitor::new(
        registry.clone(),
        cache,
        "gate-1",
        Duration::from_secs(5),
    );
    monitor.poll_once(true).await;

    connector.dead.store(true, Ordering::SeqCst);
    monitor.poll_once(false).await;
    monitor.poll_once(false).await;

    connector.dead.store(false, Ordering::SeqCst);
    monitor.poll_once(false).await;

    connector.dead.store(true, Ordering::SeqCst);
    monitor.poll_once(false).await;
    monitor.poll_once(false).await;
    assert!(registry.contains("chat-1"));
    monitor.poll_once(false).await;
    assert!(!registry.contains("chat-1"));
}

#[tokio::test]
async fn first_cycle_failure_clears_stale_entries_immediately() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = ClusterRegistry::new(Arc::clone(&store));
    let connector = Arc::new(SwitchableConnector {
        dead: Arc::new(AtomicBool::new(true)),
    });
    let cache = RpcConnectionCache::new(connector);

    registry.register(&descriptor("chat-1", "chat")).await.unwrap();
    let mut monitor = HealthMonitor::new(
        registry.clone(),
        cache,
        "gate-1",
        Duration::from_secs(5),
    );
    monitor.poll_once(true).await;
    assert!(!registry.contains("chat-1"));
}

#[tokio::test]
async fn bootstrap_rebuilds_the_view_from_the_store() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let writer = ClusterRegistry::new(Arc::clone(&store));
    writer.register(&descriptor("gate-1", "gate")).await.unwrap();
    writer.register(&descriptor("chat-1", "chat")).await.unwrap();
    writer.register(&descriptor("chat-2", "chat")).await.unwrap();

    let reader = ClusterRegistry::new(Arc::clone(&store));
    reader.bootstrap().await.unwrap();
    assert_eq!(reader.len(), 3);
    assert_eq!(reader.of_type("chat").len(), 2);
    assert_eq!(reader.of_type("gate").len(), 1);
    assert!(reader.of_type("lobby").is_empty());
}

#[tokio::test]
async fn eviction_removes_the_persisted_record() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = ClusterRegistry::new(Arc::clone(&store));
    let d = descriptor("chat-1", "chat");
    registry.register(&d).await.unwrap();
    registry.evict(&d).await.unwrap();

    let reader = ClusterRegistry::new(store);
    reader.bootstrap().await.unwrap();
    assert!(reader.is_empty());
}
