//! Request dispatch: local handler invocation and hop-by-hop forwarding.
//!
//! A routed request either targets this node's type, in which case the
//! registered handler runs here, or another type, in which case it is
//! forwarded exactly one hop to a node picked by the routing strategy.
//! Forwarded requests are handled locally by the target and never
//! forwarded again.

use crate::cluster::registry::ClusterRegistry;
use crate::cluster::routing::{RouteMessage, RouterTable};
use crate::rpc::{BackwardReply, Capability, RpcConnectionCache, RpcRequest, RpcResponse};
use crate::session::{Session, SessionDirectory};
use crate::session::channel::ChannelDirectory;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a forward may take end to end before it fails with a timeout.
pub const FORWARD_DEADLINE: Duration = Duration::from_millis(5000);

/// Ambient services a handler may reach.
#[derive(Clone)]
pub struct HandlerContext {
    pub node_id: String,
    pub node_type: String,
    pub sessions: SessionDirectory,
    pub channels: ChannelDirectory,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
pub type HandlerFn = Arc<dyn Fn(Value, Session, HandlerContext) -> HandlerFuture + Send + Sync>;

enum HandlerEntry {
    Invocable(HandlerFn),
    /// A fixed value returned for every call. Covers exported constants and
    /// static service metadata.
    StaticValue(Value),
}

/// Handlers registered under `service.method`. Built once at startup and
/// read-only afterwards, so lookups take no lock.
#[derive(Default)]
pub struct HandlerRegistry {
    services: HashMap<String, HashMap<String, HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_fn(&mut self, service: &str, method: &str, handler: HandlerFn) {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(method.to_string(), HandlerEntry::Invocable(handler));
    }

    pub fn register_value(&mut self, service: &str, method: &str, value: Value) {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(method.to_string(), HandlerEntry::StaticValue(value));
    }

    fn get(&self, service: &str, method: &str) -> Option<&HandlerEntry> {
        self.services.get(service)?.get(method)
    }
}

/// `{code: 404}`: no such service or no node to run it.
pub fn service_not_found() -> Value {
    json!({ "code": 404, "message": "service not found" })
}

/// `{code: 500}`: handler failure or forward deadline exceeded.
pub fn timeout_value() -> Value {
    json!({ "code": 500, "message": "time out" })
}

/// `{code: 505}`: the chosen node could not be reached.
pub fn unavailable_value() -> Value {
    json!({ "code": 505, "message": "service unavailable" })
}

#[derive(Clone)]
pub struct Dispatcher {
    node_id: String,
    node_type: String,
    handlers: Arc<HandlerRegistry>,
    registry: ClusterRegistry,
    routes: RouterTable,
    cache: RpcConnectionCache,
    sessions: SessionDirectory,
    deadline: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        handlers: Arc<HandlerRegistry>,
        registry: ClusterRegistry,
        routes: RouterTable,
        cache: RpcConnectionCache,
        sessions: SessionDirectory,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            handlers: Arc::clone(&handlers),
            registry,
            routes,
            cache,
            sessions,
            deadline: FORWARD_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Route a request: run it here when the route targets this node's
    /// type, forward one hop otherwise. The returned value is always a JSON
    /// document suitable for the reply body.
    pub async fn dispatch(
        &self,
        node_type: &str,
        service: &str,
        method: &str,
        params: Value,
        session: &Session,
        ctx: &HandlerContext,
    ) -> Value {
        if node_type == self.node_type {
            self.handle_local(service, method, params, session.clone(), ctx)
                .await
        } else {
            self.forward(node_type, service, method, params, session).await
        }
    }

    /// Run a registered handler. The live session snapshot is refreshed
    /// from the store first so cross-node mutations are visible to it.
    pub async fn handle_local(
        &self,
        service: &str,
        method: &str,
        params: Value,
        session: Session,
        ctx: &HandlerContext,
    ) -> Value {
        let Some(entry) = self.handlers.get(service, method) else {
            debug!(service = %service, method = %method, "no handler registered");
            return service_not_found();
        };
        if let Err(err) = self.sessions.sync(session.id()).await {
            warn!(session = %session.id(), error = %err, "session sync failed");
        }
        let session = match self.sessions.get_session(session.id()).await {
            Ok(Some(fresh)) => fresh,
            _ => session,
        };
        match entry {
            HandlerEntry::StaticValue(value) => value.clone(),
            HandlerEntry::Invocable(handler) => {
                match handler(params, session, ctx.clone()).await {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(service = %service, method = %method, error = %err, "handler failed");
                        json!({ "code": 500, "message": err.to_string() })
                    }
                }
            }
        }
    }

    /// Forward one hop to a node of the target type. Strategy selection,
    /// the transport call and reply decoding all share one deadline.
    async fn forward(
        &self,
        node_type: &str,
        service: &str,
        method: &str,
        params: Value,
        session: &Session,
    ) -> Value {
        let candidates = self.registry.of_type(node_type);
        if candidates.is_empty() {
            return service_not_found();
        }
        let message = RouteMessage {
            node_type,
            service,
            method,
            params: &params,
        };
        let chosen = self
            .routes
            .strategy_for(node_type)
            .select(session, &message, &candidates);
        // The strategy must pick from the candidates it was given; any other
        // id is treated as no route.
        let Some(target) = chosen.and_then(|id| candidates.iter().find(|c| c.id == id).cloned())
        else {
            return service_not_found();
        };

        let request = RpcRequest::BackwardMessage {
            session: session.id().to_string(),
            service: service.to_string(),
            method: method.to_string(),
            params: params.to_string(),
        };
        let call = async {
            let handle = self.cache.get(&target, Capability::Backward).await?;
            handle.call(request).await
        };
        match tokio::time::timeout(self.deadline, call).await {
            Err(_elapsed) => {
                warn!(node = %target.id, route = %format!("{node_type}.{service}.{method}"), "forward timed out");
                self.cache.evict(&target.id, Capability::Backward).await;
                timeout_value()
            }
            Ok(Err(err)) => {
                warn!(node = %target.id, error = %err, "forward transport failed");
                self.cache.evict(&target.id, Capability::Backward).await;
                unavailable_value()
            }
            Ok(Ok(RpcResponse::Backward(reply))) => decode_backward(reply),
            Ok(Ok(other)) => {
                warn!(node = %target.id, response = ?other, "unexpected forward reply");
                self.cache.evict(&target.id, Capability::Backward).await;
                unavailable_value()
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Turn a backward reply into a reply body. An explicit code passes
/// through verbatim; otherwise the body document is used, defaulting to an
/// empty object.
fn decode_backward(reply: BackwardReply) -> Value {
    if let Some(code) = reply.code {
        let mut value = json!({ "code": code });
        if let Some(message) = reply.message {
            value["message"] = json!(message);
        }
        return value;
    }
    reply
        .body
        .and_then(|body| serde_json::from_str(&body).ok())
        .unwrap_or_else(|| json!({}))
}
