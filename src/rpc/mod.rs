//! Inter-node RPC contracts and connection seams.
//!
//! Every node serves one RPC endpoint exposing three services: `backward`
//! (message forwarding), `session` (remote session control, gateway nodes
//! only), and `monitor` (health state). Requests and responses are
//! serde-tagged enums so the transport stays schema-fixed and
//! protocol-agnostic.
//!
//! - `cache` - lazy per-(node, capability) handle cache
//! - `tcp` - length-prefixed JSON-over-TCP transport

pub mod cache;
pub mod tcp;

pub use cache::RpcConnectionCache;

use crate::cluster::registry::ServerDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The remote capability a cached handle serves. One handle exists per
/// (node, capability) pair, regardless of transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Forwarded client messages (`BackwardMessage`).
    Backward,
    /// Remote session control (`PushMessage`/`Broadcast`/`SetCookie`/`Close`).
    Session,
    /// Health state polling (`GetState`).
    Monitor,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Backward => "backward",
            Capability::Session => "session",
            Capability::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RPC request envelope. Tagged with `op` on the wire; `method` stays free
/// for the forwarded route's own method name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Monitor service: liveness + load snapshot.
    GetState { from: String },
    /// Backward service: a forwarded client message, handled locally by the
    /// target and never forwarded again. `params` is a JSON document.
    BackwardMessage {
        session: String,
        service: String,
        method: String,
        params: String,
    },
    /// Session service: deliver `{event, body}` to the listed sessions.
    PushMessage {
        ids: Vec<String>,
        event: String,
        message: String,
    },
    /// Session service: deliver to every session held by the target.
    Broadcast { event: String, message: String },
    /// Session service: issue a cookie frame on a held session.
    SetCookie {
        id: String,
        key: String,
        value: String,
        expires: u64,
    },
    /// Session service: close a held session. A reason implies a framed
    /// kick notice; its absence implies a protocol-level close.
    Close {
        id: String,
        code: u16,
        reason: Option<String>,
    },
}

/// Memory/load snapshot answering a `GetState` query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateReply {
    pub id: String,
    pub memory: u64,
    pub free: u64,
    pub loadavg: Vec<f64>,
}

/// Reply to a forwarded message. `code` is set only when the target wants
/// the error passed through verbatim; otherwise `body` carries the JSON
/// result document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackwardReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// RPC response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcResponse {
    State(StateReply),
    Backward(BackwardReply),
    /// Ids that were not held by the target.
    Push { failed: Vec<String> },
    /// Locally-held sessions the broadcast reached.
    Broadcast { delivered: u64 },
    Ack { success: bool },
    /// Structured failure (e.g. session service on a non-gateway node).
    Error { code: u16, message: String },
}

/// Transport-level RPC failures. Any of these evicts the cached handle;
/// the next call pays the reconnect cost.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed rpc payload: {0}")]
    Decode(String),
}

/// A live handle to one remote node's RPC endpoint.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, RpcError>;
}

/// Creates handles on first use. The TCP connector is the production
/// implementation; tests substitute in-process connectors.
#[async_trait]
pub trait RpcConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        capability: Capability,
    ) -> Result<Arc<dyn RpcChannel>, RpcError>;
}

/// Server-side dispatch: a node's RPC surface.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn handle(&self, request: RpcRequest) -> RpcResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_roundtrip() {
        let request = RpcRequest::BackwardMessage {
            session: "s-1".into(),
            service: "echo".into(),
            method: "ping".into(),
            params: "{\"x\":1}".into(),
        };
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains("\"op\":\"backward_message\""));
        assert!(encoded.contains("\"method\":\"ping\""));
        let decoded: RpcRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn backward_reply_omits_unset_fields() {
        let reply = RpcResponse::Backward(BackwardReply {
            body: Some("{}".into()),
            ..Default::default()
        });
        let encoded = serde_json::to_string(&reply).unwrap();
        assert!(!encoded.contains("\"code\""));
        assert!(!encoded.contains("\"message\""));
    }
}
