//! Live connections held by a gateway node.
//!
//! The table maps session ids to their live connection plus an in-memory
//! snapshot of the session record. The snapshot is authoritative while the
//! connection lives; the persisted record is refreshed from it on save.

use crate::gateway::codec::{self, FrameKind};
use crate::session::session::Session;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Connection lifecycle, mirroring the socket it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Outbound half of a client connection. The gateway owns the inbound half;
/// everything that needs to reach the client goes through this seam, which
/// is what lets tests capture frames instead of opening sockets.
pub trait ClientSink: Send + Sync {
    fn state(&self) -> SocketState;
    fn send(&self, frame: Bytes);
    /// Close the underlying transport with a protocol close code.
    fn close(&self, code: u16);
}

/// One held connection: the session snapshot and its sink.
pub struct LiveSession {
    session: RwLock<Session>,
    sink: Arc<dyn ClientSink>,
}

impl LiveSession {
    pub fn new(session: Session, sink: Arc<dyn ClientSink>) -> Self {
        Self {
            session: RwLock::new(session),
            sink,
        }
    }

    pub fn snapshot(&self) -> Session {
        self.session.read().clone()
    }

    pub fn update(&self, session: Session) {
        *self.session.write() = session;
    }

    pub fn mutate(&self, f: impl FnOnce(&mut Session)) {
        f(&mut self.session.write());
    }

    pub fn sink(&self) -> &Arc<dyn ClientSink> {
        &self.sink
    }

    /// Deliver an `{event, body}` envelope as a normal frame. Frames that
    /// exceed the codec limit are dropped rather than truncated.
    pub fn push_json(&self, payload: &serde_json::Value) {
        if let Ok(frame) = codec::encode(FrameKind::Normal, payload.to_string().as_bytes()) {
            self.sink.send(frame);
        }
    }

    /// Issue a cookie frame carrying `{key, value, expires}`.
    pub fn send_cookie(&self, key: &str, value: &str, expires: u64) {
        let payload = json!({ "key": key, "value": value, "expires": expires });
        if let Ok(frame) = codec::encode(FrameKind::Cookie, payload.to_string().as_bytes()) {
            self.sink.send(frame);
        }
    }

    /// Send a kick notice then close. Used when the close carries an
    /// application reason the client should display.
    pub fn kick(&self, code: u16, reason: &str) {
        match self.sink.state() {
            SocketState::Connecting | SocketState::Open => {}
            SocketState::Closing | SocketState::Closed => return,
        }
        let payload = json!({ "code": code, "reason": reason });
        if let Ok(frame) = codec::encode(FrameKind::Kick, payload.to_string().as_bytes()) {
            self.sink.send(frame);
        }
        self.sink.close(code);
    }

    /// Close without a notice frame, only when the socket can still take it.
    pub fn close(&self, code: u16) {
        match self.sink.state() {
            SocketState::Connecting | SocketState::Open => self.sink.close(code),
            SocketState::Closing | SocketState::Closed => {}
        }
    }
}

/// All live connections on this node.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<LiveSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, live: Arc<LiveSession>) {
        let id = live.snapshot().id().to_string();
        self.sessions.write().insert(id, live);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<LiveSession>> {
        self.sessions.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<LiveSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn all(&self) -> Vec<Arc<LiveSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink {
        state: Mutex<SocketState>,
        frames: Mutex<Vec<Bytes>>,
        closes: Mutex<Vec<u16>>,
    }

    impl RecordingSink {
        fn new(state: SocketState) -> Self {
            Self {
                state: Mutex::new(state),
                frames: Mutex::new(Vec::new()),
                closes: Mutex::new(Vec::new()),
            }
        }
    }

    impl ClientSink for RecordingSink {
        fn state(&self) -> SocketState {
            *self.state.lock()
        }

        fn send(&self, frame: Bytes) {
            self.frames.lock().push(frame);
        }

        fn close(&self, code: u16) {
            self.closes.lock().push(code);
            *self.state.lock() = SocketState::Closed;
        }
    }

    #[test]
    fn kick_sends_notice_then_closes() {
        let sink = Arc::new(RecordingSink::new(SocketState::Open));
        let live = LiveSession::new(Session::with_id("s"), sink.clone());
        live.kick(2000, "duplicate login");
        assert_eq!(sink.frames.lock().len(), 1);
        assert_eq!(sink.closes.lock().as_slice(), &[2000]);
    }

    #[test]
    fn close_on_closed_socket_is_ignored() {
        let sink = Arc::new(RecordingSink::new(SocketState::Closed));
        let live = LiveSession::new(Session::with_id("s"), sink.clone());
        live.close(1000);
        assert!(sink.closes.lock().is_empty());
    }

    #[test]
    fn table_tracks_inserts_and_removals() {
        let table = SessionTable::new();
        let sink = Arc::new(RecordingSink::new(SocketState::Open));
        table.insert(Arc::new(LiveSession::new(Session::with_id("s-1"), sink)));
        assert!(table.contains("s-1"));
        assert_eq!(table.len(), 1);
        assert!(table.remove("s-1").is_some());
        assert!(table.remove("s-1").is_none());
        assert!(table.is_empty());
    }
}
