//! In-process store backend.
//!
//! Implements the full [`SharedStore`] surface, including key TTLs and the
//! notification bus, against process-local maps. Intended for tests and
//! single-node development; it is not shared across processes.

use super::{BusMessage, SharedStore, StoreError, TTL_MISSING, TTL_NONE};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Default)]
struct Tables {
    maps: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    deadlines: HashMap<String, Instant>,
}

impl Tables {
    /// Drop the key everywhere if its deadline has passed.
    fn reap(&mut self, key: &str) {
        if let Some(deadline) = self.deadlines.get(key) {
            if *deadline <= Instant::now() {
                self.deadlines.remove(key);
                self.maps.remove(key);
                self.sets.remove(key);
            }
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.maps.contains_key(key) || self.sets.contains_key(key)
    }

    fn drop_key(&mut self, key: &str) {
        self.maps.remove(key);
        self.sets.remove(key);
        self.deadlines.remove(key);
    }
}

type Subscriber = (Vec<String>, mpsc::UnboundedSender<BusMessage>);

/// In-memory [`SharedStore`] backend.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn map_put(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        tables
            .maps
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn map_put_all(&self, key: &str, entries: &[(String, String)]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        let map = tables.maps.entry(key.to_string()).or_default();
        for (field, value) in entries {
            map.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn map_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        Ok(tables.maps.get(key).cloned().unwrap_or_default())
    }

    async fn map_remove(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        if let Some(map) = tables.maps.get_mut(key) {
            map.remove(field);
            if map.is_empty() {
                tables.maps.remove(key);
            }
        }
        Ok(())
    }

    async fn map_values(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        Ok(tables
            .maps
            .get(key)
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        tables
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        if let Some(set) = tables.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                tables.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        Ok(tables
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        if !tables.exists(key) {
            return Ok(TTL_MISSING);
        }
        match tables.deadlines.get(key) {
            None => Ok(TTL_NONE),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                Ok(remaining.as_secs() as i64)
            }
        }
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.reap(key);
        if !tables.exists(key) {
            return Ok(());
        }
        if seconds <= 0 {
            tables.drop_key(key);
        } else {
            tables.deadlines.insert(
                key.to_string(),
                Instant::now() + Duration::from_secs(seconds as u64),
            );
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.tables.lock().drop_key(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let message = BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(channels, tx)| {
            if !channels.iter().any(|c| c == channel) {
                return !tx.is_closed();
            }
            tx.send(message.clone()).is_ok()
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[&str],
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .push((channels.iter().map(|c| c.to_string()).collect(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ttl_reports_missing_then_live_then_expired() {
        let store = MemoryStore::new();
        assert_eq!(store.ttl("k").await.unwrap(), TTL_MISSING);

        store.map_put("k", "f", "v").await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), TTL_NONE);

        store.expire("k", 600).await.unwrap();
        let remaining = store.ttl("k").await.unwrap();
        assert!(remaining > 0 && remaining <= 600);

        store.expire("k", 0).await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), TTL_MISSING);
        assert!(store.map_get_all("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_reaches_only_matching_subscribers() {
        let store = MemoryStore::new();
        let mut online = store.subscribe(&["online"]).await.unwrap();
        let mut both = store.subscribe(&["online", "offline"]).await.unwrap();

        store.publish("online", "a").await.unwrap();
        store.publish("offline", "b").await.unwrap();

        assert_eq!(online.recv().await.unwrap().payload, "a");
        assert_eq!(both.recv().await.unwrap().payload, "a");
        assert_eq!(both.recv().await.unwrap().payload, "b");
        assert!(online.try_recv().is_err());
    }

    #[tokio::test]
    async fn set_ops_roundtrip() {
        let store = MemoryStore::new();
        store.set_add("s", "a").await.unwrap();
        store.set_add("s", "a").await.unwrap();
        store.set_add("s", "b").await.unwrap();
        let mut members = store.set_members("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);

        store.set_remove("s", "a").await.unwrap();
        store.set_remove("s", "b").await.unwrap();
        assert_eq!(store.ttl("s").await.unwrap(), TTL_MISSING);
    }
}
