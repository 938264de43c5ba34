//! Client-facing gateway.
//!
//! Drives one framed connection from handshake to close: decodes frames,
//! answers pings, routes normal frames through the dispatcher and owns
//! the live session table entry for the connection's lifetime.
//!
//! The gateway is transport-agnostic. Whatever accepts sockets feeds
//! decoded bytes in as [`ConnEvent`]s and hands the outbound half over as
//! a [`ClientSink`].

pub mod codec;

use crate::core::time::now_millis;
use crate::dispatch::{service_not_found, Dispatcher, HandlerContext};
use crate::session::directory::SESSION_TTL_SECONDS;
use crate::session::{ClientSink, LiveSession, Session, SessionDirectory, SessionTable};
use crate::store::TTL_MISSING;
use bytes::Bytes;
use codec::{Envelope, FrameKind, Route};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Close code sent when a handshake body cannot be parsed.
pub const CLOSE_MALFORMED_HANDSHAKE: u16 = 3003;
/// Cookie under which the session id is granted for resume.
pub const SESSION_COOKIE: &str = "session";

/// Inbound events for one connection.
#[derive(Debug)]
pub enum ConnEvent {
    /// One complete wire frame, header included.
    Frame(Bytes),
    /// The transport closed, for whatever reason.
    Closed,
}

#[derive(Debug, Deserialize)]
struct HandshakeBody {
    #[serde(default)]
    headers: Value,
    #[serde(default)]
    cookies: HashMap<String, String>,
    /// Client wall clock at send time, for the latency hint in the ready
    /// frame.
    #[serde(default)]
    date: Option<u64>,
}

#[derive(Clone)]
pub struct Gateway {
    node_id: String,
    sessions: SessionDirectory,
    table: Arc<SessionTable>,
    dispatcher: Dispatcher,
    ctx: HandlerContext,
}

impl Gateway {
    pub fn new(
        node_id: impl Into<String>,
        sessions: SessionDirectory,
        table: Arc<SessionTable>,
        dispatcher: Dispatcher,
        ctx: HandlerContext,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            sessions,
            table,
            dispatcher,
            ctx,
        }
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Drive one connection until its event stream ends. The session table
    /// entry exists exactly while this future holds a handshaken session.
    pub async fn run_connection(
        &self,
        sink: Arc<dyn ClientSink>,
        mut events: mpsc::Receiver<ConnEvent>,
    ) {
        let mut live: Option<Arc<LiveSession>> = None;
        while let Some(event) = events.recv().await {
            match event {
                ConnEvent::Frame(raw) => {
                    self.on_frame(&sink, &mut live, &raw).await;
                }
                ConnEvent::Closed => break,
            }
        }
        if let Some(live) = live {
            self.on_close(&live).await;
        }
    }

    async fn on_frame(
        &self,
        sink: &Arc<dyn ClientSink>,
        live: &mut Option<Arc<LiveSession>>,
        raw: &[u8],
    ) {
        let Some(frame) = codec::decode(raw) else {
            debug!("dropping undecodable frame");
            return;
        };
        match frame.kind {
            FrameKind::Handshake => {
                if live.is_some() {
                    debug!("ignoring duplicate handshake");
                    return;
                }
                *live = self.handshake(sink, &frame.body).await;
            }
            FrameKind::Ping => {
                if let Ok(pong) = codec::encode(FrameKind::Pong, b"") {
                    sink.send(pong);
                }
            }
            FrameKind::Normal => {
                let Some(live) = live.as_ref() else {
                    debug!("dropping request before handshake");
                    return;
                };
                self.on_request(live, &frame.body).await;
            }
            // Server-to-client kinds have no meaning inbound.
            FrameKind::Pong | FrameKind::Ready | FrameKind::Kick | FrameKind::Cookie => {
                debug!(kind = ?frame.kind, "dropping unexpected frame kind");
            }
        }
    }

    /// Accept a connection: resume the session named by the resume cookie
    /// when its record still exists, mint a fresh one otherwise. Ends with
    /// a cookie grant and the ready frame.
    async fn handshake(
        &self,
        sink: &Arc<dyn ClientSink>,
        body: &[u8],
    ) -> Option<Arc<LiveSession>> {
        let Ok(hello) = serde_json::from_slice::<HandshakeBody>(body) else {
            warn!("closing connection on malformed handshake");
            sink.close(CLOSE_MALFORMED_HANDSHAKE);
            return None;
        };

        let mut session = match self.resume_target(&hello).await {
            Some(existing) => {
                info!(session = %existing.id(), "session resumed");
                existing
            }
            None => Session::anonymous(),
        };
        session.set_frontend(&self.node_id);
        if !hello.headers.is_null() {
            session.set(
                crate::session::session::FIELD_HEADERS,
                hello.headers.to_string(),
            );
        }
        if let Err(err) = self.sessions.create(&session).await {
            warn!(error = %err, "failed to persist session, closing");
            sink.close(CLOSE_MALFORMED_HANDSHAKE);
            return None;
        }

        let live = Arc::new(LiveSession::new(session.clone(), Arc::clone(sink)));
        self.table.insert(Arc::clone(&live));

        live.send_cookie(SESSION_COOKIE, session.id(), SESSION_TTL_SECONDS as u64);
        let distance = hello
            .date
            .map(|sent| now_millis().saturating_sub(sent))
            .unwrap_or(0);
        let ready = json!({ "distance": distance, "binded": session.uid().is_some() });
        if let Ok(frame) = codec::encode(FrameKind::Ready, ready.to_string().as_bytes()) {
            sink.send(frame);
        }
        debug!(session = %session.id(), "handshake complete");
        Some(live)
    }

    async fn resume_target(&self, hello: &HandshakeBody) -> Option<Session> {
        let id = hello.cookies.get(SESSION_COOKIE)?;
        match self.sessions.ttl(id).await {
            Ok(TTL_MISSING) => None,
            Ok(_) => match self.sessions.get_session(id).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(session = %id, error = %err, "resume lookup failed");
                    None
                }
            },
            Err(err) => {
                warn!(session = %id, error = %err, "resume ttl check failed");
                None
            }
        }
    }

    /// Handle one routed request. Requests without an id are notifications
    /// and never answered; everything else gets `{id, body}` back.
    async fn on_request(&self, live: &Arc<LiveSession>, body: &[u8]) {
        let Ok(envelope) = serde_json::from_slice::<Envelope>(body) else {
            debug!("dropping malformed request envelope");
            return;
        };
        let session = live.snapshot();
        let reply = match Route::parse(&envelope.route) {
            Some(route) => {
                self.dispatcher
                    .dispatch(
                        &route.node_type,
                        &route.service,
                        &route.method,
                        envelope.params,
                        &session,
                        &self.ctx,
                    )
                    .await
            }
            None => {
                debug!(route = %envelope.route, "unroutable request");
                service_not_found()
            }
        };
        let Some(id) = envelope.id else {
            return;
        };
        // The local snapshot may have moved under the handler.
        if let Some(current) = self.table.get(session.id()) {
            let reply = json!({ "id": id, "body": reply });
            current.push_json(&reply);
        }
    }

    /// Connection teardown. The persisted record and its TTL are left
    /// untouched so the client can resume; only the live entry goes away.
    async fn on_close(&self, live: &Arc<LiveSession>) {
        let id = live.snapshot().id().to_string();
        self.table.remove(&id);
        if let Err(err) = self.sessions.announce_close(&id).await {
            warn!(session = %id, error = %err, "close announcement failed");
        }
        debug!(session = %id, "connection closed");
    }

    // RPC surface, called by the node service on behalf of remote peers.

    /// Deliver to locally held sessions; returns ids not held here.
    pub fn push_message(&self, ids: &[String], event: &str, message: &str) -> Vec<String> {
        let body: Value = serde_json::from_str(message).unwrap_or_else(|_| json!(message));
        let payload = json!({ "event": event, "body": body });
        let mut failed = Vec::new();
        for id in ids {
            match self.table.get(id) {
                Some(live) => live.push_json(&payload),
                None => failed.push(id.clone()),
            }
        }
        failed
    }

    /// Deliver to every locally held session; returns how many.
    pub fn broadcast_local(&self, event: &str, message: &str) -> u64 {
        let body: Value = serde_json::from_str(message).unwrap_or_else(|_| json!(message));
        let payload = json!({ "event": event, "body": body });
        let all = self.table.all();
        for live in &all {
            live.push_json(&payload);
        }
        all.len() as u64
    }

    pub fn set_cookie(&self, id: &str, key: &str, value: &str, expires: u64) -> bool {
        match self.table.get(id) {
            Some(live) => {
                live.send_cookie(key, value, expires);
                true
            }
            None => false,
        }
    }

    pub fn close_session(&self, id: &str, code: u16, reason: Option<&str>) -> bool {
        let Some(live) = self.table.get(id) else {
            return false;
        };
        match reason {
            Some(reason) => live.kick(code, reason),
            None => live.close(code),
        }
        true
    }
}
