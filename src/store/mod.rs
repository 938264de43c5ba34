//! Shared persistent store and notification bus.
//!
//! All cross-node state (membership, session records, channel membership)
//! lives behind the [`SharedStore`] trait: a small hash/set/TTL surface plus
//! a publish/subscribe bus. Two backends are provided:
//! - `memory` - in-process backend for tests and single-node development
//! - `redis` - production backend over a Redis deployment
//!
//! Nodes never coordinate through anything else; the store is the single
//! source of truth and the bus is advisory (eventually consistent).

pub mod keys;
pub mod memory;
pub mod redis;

use crate::core::config::{StoreBackend, StoreConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message delivered on a subscribed bus channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Errors surfaced by store backends. Connectivity loss is reported upward,
/// never masked or retried at this layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connect(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("store subscription failed: {0}")]
    Subscribe(String),
}

/// Key TTL sentinel: the key exists but carries no expiry.
pub const TTL_NONE: i64 = -1;
/// Key TTL sentinel: the key does not exist (expired or never written).
pub const TTL_MISSING: i64 = -2;

/// Shared persistent store + pub/sub bus.
///
/// Hash keys hold string field maps (session records, server descriptors),
/// set keys hold string members (channel membership). TTLs apply to whole
/// keys. `subscribe` returns a receiver fed for the life of the connection;
/// dropping it cancels the subscription.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn map_put(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn map_put_all(&self, key: &str, entries: &[(String, String)]) -> Result<(), StoreError>;
    async fn map_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn map_remove(&self, key: &str, field: &str) -> Result<(), StoreError>;
    async fn map_values(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Remaining TTL in seconds, [`TTL_NONE`] or [`TTL_MISSING`].
    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;
    async fn expire(&self, key: &str, seconds: i64) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
    async fn subscribe(
        &self,
        channels: &[&str],
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, StoreError>;
}

/// Construct the configured store backend.
pub async fn open_store(cfg: &StoreConfig) -> Result<Arc<dyn SharedStore>, StoreError> {
    match cfg.backend {
        StoreBackend::Memory => Ok(Arc::new(memory::MemoryStore::new())),
        StoreBackend::Redis => {
            let store = redis::RedisStore::connect(&cfg.url).await?;
            Ok(Arc::new(store))
        }
    }
}
