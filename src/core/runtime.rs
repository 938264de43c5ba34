//! Node runtime orchestration.
//!
//! Wires the store, registry, RPC endpoint, session directory and gateway
//! together, then supervises them until shutdown. Every node, gateway or
//! not, serves the RPC endpoint; only gateway nodes hold client
//! connections and answer session-control requests.

use crate::cluster::health::HealthMonitor;
use crate::cluster::registry::{ClusterRegistry, ServerDescriptor};
use crate::cluster::routing::RouterTable;
use crate::core::config::Config;
use crate::dispatch::{Dispatcher, HandlerContext, HandlerRegistry};
use crate::gateway::Gateway;
use crate::rpc::tcp::TcpRpcConnector;
use crate::rpc::{
    BackwardReply, RpcConnectionCache, RpcRequest, RpcResponse, RpcService, StateReply,
};
use crate::session::channel::ChannelDirectory;
use crate::session::{Session, SessionDirectory, SessionTable};
use crate::store::keys::{CHANNEL_OFFLINE, CHANNEL_ONLINE, CHANNEL_SESSION_CLOSE};
use crate::store::SharedStore;
use crate::telemetry::LogHandle;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct NodeRuntime {
    config: Config,
    descriptor: ServerDescriptor,
    registry: ClusterRegistry,
    cache: RpcConnectionCache,
    store: Arc<dyn SharedStore>,
    sessions: SessionDirectory,
    service: Arc<NodeService>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl NodeRuntime {
    pub fn new(
        config: Config,
        store: Arc<dyn SharedStore>,
        handlers: HandlerRegistry,
        log_handle: Option<LogHandle>,
    ) -> Result<Self> {
        let descriptor = ServerDescriptor::new(
            &config.node.id,
            &config.node.host,
            &config.hostname(),
            config.node.port,
            &config.node.node_type,
            &config.node.version,
        );
        let registry = ClusterRegistry::new(Arc::clone(&store));
        let cache = RpcConnectionCache::new(Arc::new(TcpRpcConnector));
        let table = config.gateway.enabled.then(|| Arc::new(SessionTable::new()));
        let sessions = SessionDirectory::new(
            Arc::clone(&store),
            registry.clone(),
            cache.clone(),
            &config.node.id,
            table.clone(),
        );
        let channels = ChannelDirectory::new(Arc::clone(&store), sessions.clone());
        let ctx = HandlerContext {
            node_id: config.node.id.clone(),
            node_type: config.node.node_type.clone(),
            sessions: sessions.clone(),
            channels,
        };
        let dispatcher = Dispatcher::new(
            &config.node.id,
            &config.node.node_type,
            Arc::new(handlers),
            registry.clone(),
            RouterTable::new(),
            cache.clone(),
            sessions.clone(),
        )
        .with_deadline(Duration::from_millis(config.forward.deadline_ms));
        let gateway = table.map(|table| {
            Gateway::new(
                &config.node.id,
                sessions.clone(),
                table,
                dispatcher.clone(),
                ctx.clone(),
            )
        });
        let service = Arc::new(NodeService {
            node_id: config.node.id.clone(),
            sessions: sessions.clone(),
            dispatcher,
            ctx,
            gateway,
            system: Mutex::new(System::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            descriptor,
            registry,
            cache,
            store,
            sessions,
            service,
            shutdown_tx,
            shutdown_rx,
            log_handle,
        })
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionDirectory {
        &self.sessions
    }

    /// Client-facing gateway, present when `gateway.enabled`.
    pub fn gateway(&self) -> Option<&Gateway> {
        self.service.gateway.as_ref()
    }

    pub fn log_handle(&self) -> Option<LogHandle> {
        self.log_handle.clone()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Start every subsystem: RPC endpoint, membership feeds, cluster
    /// registration and the health monitor.
    pub async fn start(&mut self) -> Result<()> {
        let bind = self.descriptor.rpc_addr();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind rpc endpoint on {bind}"))?;
        info!(bind = %bind, "rpc endpoint listening");
        tokio::spawn(crate::rpc::tcp::serve(
            listener,
            Arc::clone(&self.service) as Arc<dyn RpcService>,
            self.shutdown_rx.clone(),
        ));

        self.registry.bootstrap().await?;
        self.start_membership_feed().await?;
        self.start_session_close_feed().await?;
        self.registry.register(&self.descriptor).await?;

        if self.config.health.enabled {
            let monitor = HealthMonitor::new(
                self.registry.clone(),
                self.cache.clone(),
                &self.config.node.id,
                Duration::from_secs(self.config.health.period_seconds),
            );
            tokio::spawn(monitor.run(self.shutdown_rx.clone()));
        }
        Ok(())
    }

    /// Run until CTRL+C or a component requests shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                info!("shutdown requested by component");
            }
        }
        self.shutdown().await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Err(err) = self.registry.evict(&self.descriptor).await {
            warn!(error = %err, "failed to deregister on shutdown");
        }
        self.shutdown_tx
            .send(true)
            .context("failed to broadcast shutdown")?;
        Ok(())
    }

    /// Keep the local membership view current from `online`/`offline`
    /// announcements. A departed node also loses its cached RPC handles.
    async fn start_membership_feed(&self) -> Result<()> {
        let mut feed = self
            .store
            .subscribe(&[CHANNEL_ONLINE, CHANNEL_OFFLINE])
            .await
            .context("membership subscription failed")?;
        let registry = self.registry.clone();
        let cache = self.cache.clone();
        let self_id = self.config.node.id.clone();
        tokio::spawn(async move {
            while let Some(event) = feed.recv().await {
                let descriptor: ServerDescriptor = match serde_json::from_str(&event.payload) {
                    Ok(descriptor) => descriptor,
                    Err(err) => {
                        warn!(error = %err, "malformed membership announcement");
                        continue;
                    }
                };
                if descriptor.id == self_id {
                    continue;
                }
                match event.channel.as_str() {
                    CHANNEL_ONLINE => {
                        debug!(node = %descriptor.id, "node online");
                        registry.add(descriptor);
                    }
                    CHANNEL_OFFLINE => {
                        debug!(node = %descriptor.id, "node offline");
                        registry.remove(&descriptor);
                        cache.evict_node(&descriptor.id).await;
                    }
                    other => debug!(channel = %other, "unexpected membership channel"),
                }
            }
        });
        Ok(())
    }

    /// Feed close announcements to directory waiters.
    async fn start_session_close_feed(&self) -> Result<()> {
        let mut feed = self
            .store
            .subscribe(&[CHANNEL_SESSION_CLOSE])
            .await
            .context("session close subscription failed")?;
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            while let Some(event) = feed.recv().await {
                sessions.notify_closed(&event.payload).await;
            }
        });
        Ok(())
    }
}

/// This node's RPC surface.
pub struct NodeService {
    node_id: String,
    sessions: SessionDirectory,
    dispatcher: Dispatcher,
    ctx: HandlerContext,
    gateway: Option<Gateway>,
    system: Mutex<System>,
}

#[async_trait]
impl RpcService for NodeService {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::GetState { from } => {
                debug!(from = %from, "state probe");
                RpcResponse::State(self.state_snapshot())
            }
            RpcRequest::BackwardMessage {
                session,
                service,
                method,
                params,
            } => {
                self.handle_backward(&session, &service, &method, &params)
                    .await
            }
            RpcRequest::PushMessage { ids, event, message } => match &self.gateway {
                Some(gateway) => RpcResponse::Push {
                    failed: gateway.push_message(&ids, &event, &message),
                },
                None => no_gateway(),
            },
            RpcRequest::Broadcast { event, message } => match &self.gateway {
                Some(gateway) => RpcResponse::Broadcast {
                    delivered: gateway.broadcast_local(&event, &message),
                },
                None => no_gateway(),
            },
            RpcRequest::SetCookie {
                id,
                key,
                value,
                expires,
            } => match &self.gateway {
                Some(gateway) => RpcResponse::Ack {
                    success: gateway.set_cookie(&id, &key, &value, expires),
                },
                None => no_gateway(),
            },
            RpcRequest::Close { id, code, reason } => match &self.gateway {
                Some(gateway) => RpcResponse::Ack {
                    success: gateway.close_session(&id, code, reason.as_deref()),
                },
                None => no_gateway(),
            },
        }
    }
}

impl NodeService {
    /// Run a forwarded message through the local dispatcher. The full
    /// result document travels back as the body, error codes included, so
    /// no handler field is lost in transit; splitting out `code` is the
    /// caller's business.
    async fn handle_backward(
        &self,
        session_id: &str,
        service: &str,
        method: &str,
        params: &str,
    ) -> RpcResponse {
        let session = match self.sessions.get_session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => Session::with_id(session_id),
            Err(err) => {
                warn!(session = %session_id, error = %err, "session lookup failed");
                Session::with_id(session_id)
            }
        };
        let params: Value = serde_json::from_str(params).unwrap_or(Value::Null);
        let result = self
            .dispatcher
            .handle_local(service, method, params, session, &self.ctx)
            .await;
        RpcResponse::Backward(BackwardReply {
            body: Some(result.to_string()),
            ..Default::default()
        })
    }

    fn state_snapshot(&self) -> StateReply {
        let mut system = self.system.lock();
        system.refresh_memory();
        let load = System::load_average();
        StateReply {
            id: self.node_id.clone(),
            memory: system.total_memory(),
            free: system.available_memory(),
            loadavg: vec![load.one, load.five, load.fifteen],
        }
    }
}

fn no_gateway() -> RpcResponse {
    RpcResponse::Error {
        code: 404,
        message: "no gateway on this node".to_string(),
    }
}
