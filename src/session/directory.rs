//! Cluster-wide session directory.
//!
//! Every session has one persisted record in the shared store and at most
//! one live connection somewhere in the cluster. The directory resolves
//! both views: reads prefer the local live snapshot, writes go to the
//! store, and control operations (push, cookie, close) are executed
//! locally when this node owns the connection and over RPC otherwise.

use crate::cluster::registry::ClusterRegistry;
use crate::rpc::{Capability, RpcConnectionCache, RpcRequest, RpcResponse};
use crate::session::session::Session;
use crate::session::table::SessionTable;
use crate::store::keys::{session_key, CHANNEL_SESSION_CLOSE};
use crate::store::{SharedStore, StoreError, TTL_MISSING};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Default session record lifetime: seven days.
pub const SESSION_TTL_SECONDS: i64 = 604_800;

/// Default close code for a forced kick.
pub const KICK_CODE: u16 = 2000;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct DirectoryInner {
    store: Arc<dyn SharedStore>,
    registry: ClusterRegistry,
    cache: RpcConnectionCache,
    node_id: String,
    /// Present on gateway nodes only.
    local: Option<Arc<SessionTable>>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

#[derive(Clone)]
pub struct SessionDirectory {
    inner: Arc<DirectoryInner>,
}

impl SessionDirectory {
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: ClusterRegistry,
        cache: RpcConnectionCache,
        node_id: impl Into<String>,
        local: Option<Arc<SessionTable>>,
    ) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                store,
                registry,
                cache,
                node_id: node_id.into(),
                local,
                waiters: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn local_table(&self) -> Option<&Arc<SessionTable>> {
        self.inner.local.as_ref()
    }

    /// Current view of the session: live snapshot when this node holds the
    /// connection, otherwise the persisted record.
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, DirectoryError> {
        if let Some(table) = &self.inner.local {
            if let Some(live) = table.get(id) {
                return Ok(Some(live.snapshot()));
            }
        }
        let settings = self.inner.store.map_get_all(&session_key(id)).await?;
        if settings.is_empty() {
            return Ok(None);
        }
        Ok(Session::from_settings(settings))
    }

    /// Refresh a local live snapshot from the persisted record. A no-op on
    /// nodes or sessions without a live connection.
    pub async fn sync(&self, id: &str) -> Result<(), DirectoryError> {
        let Some(table) = &self.inner.local else {
            return Ok(());
        };
        let Some(live) = table.get(id) else {
            return Ok(());
        };
        let settings = self.inner.store.map_get_all(&session_key(id)).await?;
        if let Some(session) = Session::from_settings(settings) {
            live.update(session);
        }
        Ok(())
    }

    /// Persist session fields. When `keys` is given only those fields are
    /// written, and only while the record still exists, so a partial save
    /// racing an expiry cannot resurrect a fragment of the session. A full
    /// save writes the whole settings map unconditionally. Returns whether
    /// the write happened.
    pub async fn save(
        &self,
        session: &Session,
        keys: Option<&[String]>,
    ) -> Result<bool, DirectoryError> {
        let key = session_key(session.id());
        if keys.is_some() && self.inner.store.ttl(&key).await? == TTL_MISSING {
            debug!(session = %session.id(), "skipping partial save of expired session");
            return Ok(false);
        }
        let entries = match keys {
            Some(keys) => session.entries_for(keys),
            None => session.entries(),
        };
        if entries.is_empty() {
            return Ok(true);
        }
        self.inner.store.map_put_all(&key, &entries).await?;
        Ok(true)
    }

    /// First write of a fresh record. Unlike [`save`] this does not require
    /// the key to exist yet.
    pub async fn create(&self, session: &Session) -> Result<(), DirectoryError> {
        let key = session_key(session.id());
        self.inner.store.map_put_all(&key, &session.entries()).await?;
        self.inner.store.expire(&key, SESSION_TTL_SECONDS).await?;
        Ok(())
    }

    pub async fn ttl(&self, id: &str) -> Result<i64, DirectoryError> {
        Ok(self.inner.store.ttl(&session_key(id)).await?)
    }

    /// Extend the record lifetime, defaulting to seven days.
    pub async fn expire(&self, id: &str, seconds: Option<i64>) -> Result<(), DirectoryError> {
        let seconds = seconds.unwrap_or(SESSION_TTL_SECONDS);
        Ok(self.inner.store.expire(&session_key(id), seconds).await?)
    }

    pub async fn remove_field(&self, id: &str, field: &str) -> Result<(), DirectoryError> {
        Ok(self.inner.store.map_remove(&session_key(id), field).await?)
    }

    /// Drop the persisted record entirely.
    pub async fn destroy(&self, id: &str) -> Result<(), DirectoryError> {
        Ok(self.inner.store.remove(&session_key(id)).await?)
    }

    /// Deliver `{event, body}` to the listed sessions wherever their
    /// connections live. Returns the ids that could not be reached. Remote
    /// delivery failures evict the stale handle and count every targeted id
    /// as failed; there is no retry.
    pub async fn push_message(
        &self,
        ids: &[String],
        event: &str,
        message: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        let mut by_owner: HashMap<String, Vec<String>> = HashMap::new();
        let mut failed = Vec::new();
        for id in ids {
            match self.get_session(id).await? {
                Some(session) => match session.frontend() {
                    Some(owner) => by_owner.entry(owner.to_string()).or_default().push(id.clone()),
                    None => failed.push(id.clone()),
                },
                None => failed.push(id.clone()),
            }
        }

        for (owner, ids) in by_owner {
            failed.extend(self.deliver_to(&owner, &ids, event, message).await);
        }
        Ok(failed)
    }

    /// Deliver to sessions known to live on one node. Returns the ids that
    /// were not reached.
    pub(crate) async fn deliver_to(
        &self,
        owner: &str,
        ids: &[String],
        event: &str,
        message: &str,
    ) -> Vec<String> {
        if owner == self.inner.node_id {
            let body: serde_json::Value =
                serde_json::from_str(message).unwrap_or_else(|_| json!(message));
            let payload = json!({ "event": event, "body": body });
            return self.push_local(ids, &payload);
        }
        match self.remote_push(owner, ids, event, message).await {
            Some(failed) => failed,
            None => ids.to_vec(),
        }
    }

    fn push_local(&self, ids: &[String], payload: &serde_json::Value) -> Vec<String> {
        let Some(table) = &self.inner.local else {
            return ids.to_vec();
        };
        let mut failed = Vec::new();
        for id in ids {
            match table.get(id) {
                Some(live) => live.push_json(payload),
                None => failed.push(id.clone()),
            }
        }
        failed
    }

    async fn remote_push(
        &self,
        owner: &str,
        ids: &[String],
        event: &str,
        message: &str,
    ) -> Option<Vec<String>> {
        let descriptor = self.inner.registry.get(owner)?;
        let handle = match self.inner.cache.get(&descriptor, Capability::Session).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(node = %owner, error = %err, "session push connect failed");
                return None;
            }
        };
        let request = RpcRequest::PushMessage {
            ids: ids.to_vec(),
            event: event.to_string(),
            message: message.to_string(),
        };
        match handle.call(request).await {
            Ok(RpcResponse::Push { failed }) => Some(failed),
            Ok(other) => {
                warn!(node = %owner, response = ?other, "unexpected push reply");
                self.inner.cache.evict(owner, Capability::Session).await;
                None
            }
            Err(err) => {
                warn!(node = %owner, error = %err, "session push failed");
                self.inner.cache.evict(owner, Capability::Session).await;
                None
            }
        }
    }

    /// Deliver `{event, body}` to every session on every gateway of the
    /// given type. A failed node is skipped; delivery continues elsewhere.
    pub async fn broadcast(
        &self,
        node_type: &str,
        event: &str,
        message: &str,
    ) -> Result<(), DirectoryError> {
        let body: serde_json::Value =
            serde_json::from_str(message).unwrap_or_else(|_| json!(message));
        let payload = json!({ "event": event, "body": body });

        for server in self.inner.registry.of_type(node_type) {
            if server.id == self.inner.node_id {
                if let Some(table) = &self.inner.local {
                    for live in table.all() {
                        live.push_json(&payload);
                    }
                }
                continue;
            }
            let handle = match self.inner.cache.get(&server, Capability::Session).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(node = %server.id, error = %err, "broadcast connect failed");
                    continue;
                }
            };
            let request = RpcRequest::Broadcast {
                event: event.to_string(),
                message: message.to_string(),
            };
            if let Err(err) = handle.call(request).await {
                warn!(node = %server.id, error = %err, "broadcast failed");
                self.inner.cache.evict(&server.id, Capability::Session).await;
            }
        }
        Ok(())
    }

    /// Issue a cookie on a live session. Returns whether delivery happened.
    pub async fn set_cookie(
        &self,
        id: &str,
        key: &str,
        value: &str,
        expires: u64,
    ) -> Result<bool, DirectoryError> {
        let Some(session) = self.get_session(id).await? else {
            return Ok(false);
        };
        let Some(owner) = session.frontend().map(str::to_string) else {
            return Ok(false);
        };
        if owner == self.inner.node_id {
            if let Some(live) = self.inner.local.as_ref().and_then(|t| t.get(id)) {
                live.send_cookie(key, value, expires);
                return Ok(true);
            }
            return Ok(false);
        }
        let request = RpcRequest::SetCookie {
            id: id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            expires,
        };
        Ok(self.remote_control(&owner, request).await)
    }

    /// Close a live session. A reason implies a kick notice frame before the
    /// close; without one the socket is closed with the bare code.
    pub async fn close(
        &self,
        id: &str,
        code: u16,
        reason: Option<&str>,
    ) -> Result<bool, DirectoryError> {
        let Some(session) = self.get_session(id).await? else {
            return Ok(false);
        };
        let Some(owner) = session.frontend().map(str::to_string) else {
            return Ok(false);
        };
        if owner == self.inner.node_id {
            let Some(live) = self.inner.local.as_ref().and_then(|t| t.get(id)) else {
                return Ok(false);
            };
            match reason {
                Some(reason) => live.kick(code, reason),
                None => live.close(code),
            }
            return Ok(true);
        }
        let request = RpcRequest::Close {
            id: id.to_string(),
            code,
            reason: reason.map(str::to_string),
        };
        Ok(self.remote_control(&owner, request).await)
    }

    /// Forced disconnect with a reason the client should display.
    pub async fn kickout(&self, id: &str, reason: &str) -> Result<bool, DirectoryError> {
        self.close(id, KICK_CODE, Some(reason)).await
    }

    async fn remote_control(&self, owner: &str, request: RpcRequest) -> bool {
        let Some(descriptor) = self.inner.registry.get(owner) else {
            return false;
        };
        let handle = match self.inner.cache.get(&descriptor, Capability::Session).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(node = %owner, error = %err, "session control connect failed");
                return false;
            }
        };
        match handle.call(request).await {
            Ok(RpcResponse::Ack { success }) => success,
            Ok(other) => {
                warn!(node = %owner, response = ?other, "unexpected control reply");
                self.inner.cache.evict(owner, Capability::Session).await;
                false
            }
            Err(err) => {
                warn!(node = %owner, error = %err, "session control failed");
                self.inner.cache.evict(owner, Capability::Session).await;
                false
            }
        }
    }

    /// Announce that a locally held connection closed. The persisted record
    /// keeps its TTL, which is what makes handshake resume possible.
    pub async fn announce_close(&self, id: &str) -> Result<(), DirectoryError> {
        Ok(self.inner.store.publish(CHANNEL_SESSION_CLOSE, id).await?)
    }

    /// Resolve once the named session's close announcement arrives.
    pub async fn subscribe_close(&self, id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Feed a close announcement from the bus to any waiters.
    pub async fn notify_closed(&self, id: &str) {
        if let Some(waiters) = self.inner.waiters.lock().await.remove(id) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcChannel, RpcConnector, RpcError};
    use crate::session::session::FIELD_UID;
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

    fn directory(local: Option<Arc<SessionTable>>) -> SessionDirectory {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let registry = ClusterRegistry::new(Arc::clone(&store));
        let cache = RpcConnectionCache::new(Arc::new(NoConnector));
        SessionDirectory::new(store, registry, cache, "gate-1", local)
    }

    #[tokio::test]
    async fn full_save_writes_even_without_a_record() {
        let dir = directory(None);
        let mut session = Session::with_id("s-1");
        session.bind("u-1");
        assert!(dir.save(&session, None).await.unwrap());
        let loaded = dir.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(loaded.uid(), Some("u-1"));

        session.set("room", "lobby");
        assert!(dir.save(&session, None).await.unwrap());
        let loaded = dir.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(loaded.get("room"), Some("lobby"));
    }

    #[tokio::test]
    async fn partial_save_skips_expired_records() {
        let dir = directory(None);
        let mut session = Session::with_id("s-1");
        session.bind("u-1");
        let keys = vec![FIELD_UID.to_string()];
        assert!(!dir.save(&session, Some(&keys)).await.unwrap());
        assert_eq!(dir.get_session("s-1").await.unwrap(), None);

        dir.create(&session).await.unwrap();
        assert!(dir.save(&session, Some(&keys)).await.unwrap());
    }

    #[tokio::test]
    async fn partial_save_writes_only_named_fields() {
        let dir = directory(None);
        let mut session = Session::with_id("s-2");
        dir.create(&session).await.unwrap();
        session.set("a", "1");
        session.set("b", "2");
        dir.save(&session, Some(&["a".to_string(), "id".to_string()]))
            .await
            .unwrap();
        let loaded = dir.get_session("s-2").await.unwrap().unwrap();
        assert_eq!(loaded.get("a"), Some("1"));
        assert_eq!(loaded.get("b"), None);
    }

    #[tokio::test]
    async fn push_to_unknown_session_reports_it_failed() {
        let dir = directory(Some(Arc::new(SessionTable::new())));
        let failed = dir
            .push_message(&["ghost".to_string()], "notice", "{}")
            .await
            .unwrap();
        assert_eq!(failed, vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn close_waiters_fire_once_notified() {
        let dir = directory(None);
        let rx = dir.subscribe_close("s-9").await;
        dir.notify_closed("s-9").await;
        rx.await.unwrap();
    }
}
