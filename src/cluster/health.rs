//! Periodic peer liveness polling.
//!
//! Every cycle the monitor sends a `GetState` probe to each known peer.
//! A failed probe evicts that peer's monitor handle so the next cycle
//! reconnects from scratch; three consecutive failures (or any failure on
//! the very first cycle, when no history exists to give benefit of the
//! doubt) evict the peer from the registry.

use crate::cluster::registry::ClusterRegistry;
use crate::rpc::{Capability, RpcConnectionCache, RpcRequest, RpcResponse};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Consecutive probe failures before a peer is declared gone.
const EVICT_AFTER_FAILURES: u32 = 3;

pub struct HealthMonitor {
    registry: ClusterRegistry,
    cache: RpcConnectionCache,
    node_id: String,
    period: Duration,
    failures: HashMap<String, u32>,
}

impl HealthMonitor {
    pub fn new(
        registry: ClusterRegistry,
        cache: RpcConnectionCache,
        node_id: impl Into<String>,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            node_id: node_id.into(),
            period,
            failures: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut first_cycle = true;
        info!(period_ms = self.period.as_millis() as u64, "health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(first_cycle).await;
                    first_cycle = false;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("health monitor stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One full probe cycle over every peer. `first_cycle` tightens the
    /// eviction threshold to a single failure, so stale registry entries
    /// left by a crashed peer are cleared on startup.
    pub async fn poll_once(&mut self, first_cycle: bool) {
        let peers: Vec<_> = self
            .registry
            .servers()
            .into_iter()
            .filter(|s| s.id != self.node_id)
            .collect();

        for peer in &peers {
            if self.probe(peer).await {
                self.failures.remove(&peer.id);
                continue;
            }
            self.cache.evict(&peer.id, Capability::Monitor).await;
            let count = self.failures.entry(peer.id.clone()).or_insert(0);
            *count += 1;
            warn!(node = %peer.id, failures = *count, "health probe failed");
            if first_cycle || *count >= EVICT_AFTER_FAILURES {
                info!(node = %peer.id, "evicting unresponsive node");
                if let Err(err) = self.registry.evict(peer).await {
                    warn!(node = %peer.id, error = %err, "eviction failed");
                }
                self.cache.evict_node(&peer.id).await;
                self.failures.remove(&peer.id);
            }
        }

        let live: std::collections::HashSet<_> =
            peers.into_iter().map(|s| s.id).collect();
        self.failures.retain(|id, _| live.contains(id));
    }

    async fn probe(&self, peer: &crate::cluster::registry::ServerDescriptor) -> bool {
        let handle = match self.cache.get(peer, Capability::Monitor).await {
            Ok(handle) => handle,
            Err(err) => {
                debug!(node = %peer.id, error = %err, "monitor connect failed");
                return false;
            }
        };
        let request = RpcRequest::GetState {
            from: self.node_id.clone(),
        };
        match handle.call(request).await {
            Ok(RpcResponse::State(state)) => {
                debug!(node = %state.id, memory = state.memory, free = state.free, "peer state");
                true
            }
            Ok(other) => {
                debug!(node = %peer.id, response = ?other, "unexpected monitor reply");
                false
            }
            Err(err) => {
                debug!(node = %peer.id, error = %err, "monitor call failed");
                false
            }
        }
    }
}
