//! Redis store backend.
//!
//! Commands go through a shared [`ConnectionManager`]; each `subscribe` call
//! opens a dedicated pub/sub connection and forwards messages into an
//! unbounded channel until the receiver is dropped.

use super::{BusMessage, SharedStore, StoreError};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use tokio::sync::mpsc;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Command(err.to_string())
    }
}

/// Redis-backed [`SharedStore`].
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|err| StoreError::Connect(err.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|err| StoreError::Connect(err.to_string()))?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn map_put(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.hset(key, field, value).await?;
        Ok(())
    }

    async fn map_put_all(&self, key: &str, entries: &[(String, String)]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let _: () = con.hset_multiple(key, entries).await?;
        Ok(())
    }

    async fn map_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut con = self.manager.clone();
        let map: HashMap<String, String> = con.hgetall(key).await?;
        Ok(map)
    }

    async fn map_remove(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.hdel(key, field).await?;
        Ok(())
    }

    async fn map_values(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.manager.clone();
        let values: Vec<String> = con.hvals(key).await?;
        Ok(values)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.manager.clone();
        let members: Vec<String> = con.smembers(key).await?;
        Ok(members)
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut con = self.manager.clone();
        let ttl: i64 = con.ttl(key).await?;
        Ok(ttl)
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        if seconds <= 0 {
            let _: () = con.del(key).await?;
        } else {
            let _: () = con.expire(key, seconds).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.del(key).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[&str],
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| StoreError::Subscribe(err.to_string()))?;
        for channel in channels {
            pubsub
                .subscribe(*channel)
                .await
                .map_err(|err| StoreError::Subscribe(err.to_string()))?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = msg.get_payload().unwrap_or_default();
                if tx.send(BusMessage { channel, payload }).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
