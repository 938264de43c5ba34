//! Cluster membership registry.
//!
//! Each node keeps a local view of the cluster: every known server by id,
//! and servers grouped by type. The view is bootstrapped from the shared
//! store and then maintained from `online`/`offline` bus events. Membership
//! is eventually consistent; the last announcement wins.

use crate::cluster::routing::route_hash;
use crate::core::time::now_millis;
use crate::store::keys::{servers_key, type_servers_key, CHANNEL_OFFLINE, CHANNEL_ONLINE};
use crate::store::{SharedStore, StoreError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Canonical description of a cluster member.
///
/// The routing hash is derived from the id by [`ClusterRegistry::add`] and
/// never serialized; ephemeral RPC handles live in the connection cache's
/// side table, so descriptors stay cheap to persist and propagate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    pub host: String,
    pub hostname: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub node_type: String,
    pub version: String,
    /// Wall-clock ms at registration time.
    pub alive: u64,
    #[serde(skip)]
    pub route_hash: u64,
}

impl ServerDescriptor {
    pub fn new(
        id: &str,
        host: &str,
        hostname: &str,
        port: u16,
        node_type: &str,
        version: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            hostname: hostname.to_string(),
            port,
            node_type: node_type.to_string(),
            version: version.to_string(),
            alive: now_millis(),
            route_hash: 0,
        }
    }

    /// Address remote nodes dial for RPC.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed descriptor: {0}")]
    Malformed(#[from] serde_json::Error),
}

struct RegistryInner {
    store: Arc<dyn SharedStore>,
    servers: RwLock<HashMap<String, ServerDescriptor>>,
    by_type: RwLock<HashMap<String, HashMap<String, ServerDescriptor>>>,
}

/// Local view of cluster membership.
#[derive(Clone)]
pub struct ClusterRegistry {
    inner: Arc<RegistryInner>,
}

impl ClusterRegistry {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                servers: RwLock::new(HashMap::new()),
                by_type: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Load the complete persisted membership set into the local view.
    /// Called once at startup, before subscribing to incremental events.
    pub async fn bootstrap(&self) -> Result<(), RegistryError> {
        let raw = self.inner.store.map_values(&servers_key()).await?;
        for entry in raw {
            match serde_json::from_str::<ServerDescriptor>(&entry) {
                Ok(descriptor) => self.add(descriptor),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed persisted descriptor");
                }
            }
        }
        Ok(())
    }

    /// Persist this node's descriptor and announce it. The record is written
    /// under both the global and per-type keys before the `online` event is
    /// published, so an observer of the announcement can always read it back.
    pub async fn register(&self, descriptor: &ServerDescriptor) -> Result<(), RegistryError> {
        let encoded = serde_json::to_string(descriptor)?;
        let store = &self.inner.store;
        store
            .map_put(&servers_key(), &descriptor.id, &encoded)
            .await?;
        store
            .map_put(
                &type_servers_key(&descriptor.node_type),
                &descriptor.id,
                &encoded,
            )
            .await?;
        self.add(descriptor.clone());
        store.publish(CHANNEL_ONLINE, &encoded).await?;
        tracing::info!(id = %descriptor.id, node_type = %descriptor.node_type, "registered in cluster");
        Ok(())
    }

    /// Remove a lost node's persisted record and announce its departure.
    pub async fn evict(&self, descriptor: &ServerDescriptor) -> Result<(), RegistryError> {
        let encoded = serde_json::to_string(descriptor)?;
        let store = &self.inner.store;
        store.map_remove(&servers_key(), &descriptor.id).await?;
        store
            .map_remove(&type_servers_key(&descriptor.node_type), &descriptor.id)
            .await?;
        store.publish(CHANNEL_OFFLINE, &encoded).await?;
        self.remove(descriptor);
        tracing::warn!(id = %descriptor.id, "evicted from cluster");
        Ok(())
    }

    /// Insert or refresh a descriptor in the local view. Idempotent; the
    /// routing hash is (re)computed here so bootstrapped and announced
    /// descriptors end up identical.
    pub fn add(&self, mut descriptor: ServerDescriptor) {
        descriptor.route_hash = route_hash(&descriptor.id);
        self.inner
            .by_type
            .write()
            .entry(descriptor.node_type.clone())
            .or_default()
            .insert(descriptor.id.clone(), descriptor.clone());
        self.inner
            .servers
            .write()
            .insert(descriptor.id.clone(), descriptor);
    }

    /// Drop a descriptor from the local view.
    pub fn remove(&self, descriptor: &ServerDescriptor) {
        self.inner.servers.write().remove(&descriptor.id);
        let mut by_type = self.inner.by_type.write();
        if let Some(group) = by_type.get_mut(&descriptor.node_type) {
            group.remove(&descriptor.id);
            if group.is_empty() {
                by_type.remove(&descriptor.node_type);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<ServerDescriptor> {
        self.inner.servers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.servers.read().contains_key(id)
    }

    pub fn servers(&self) -> Vec<ServerDescriptor> {
        self.inner.servers.read().values().cloned().collect()
    }

    pub fn of_type(&self, node_type: &str) -> Vec<ServerDescriptor> {
        self.inner
            .by_type
            .read()
            .get(node_type)
            .map(|group| group.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.servers.read().is_empty()
    }
}
