//! Routing hash and target selection strategies.
//!
//! Every registered server carries a routing hash derived once from its id.
//! A strategy maps `(session, message, candidates)` to the id of one
//! candidate, or nothing when no candidate exists. Strategies are pure;
//! selection state lives entirely in the inputs.

use crate::cluster::registry::ServerDescriptor;
use crate::session::Session;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

/// Size of the routing hash space. Session and server hashes land in the
/// same space so the affinity scan in [`HashRoute`] is meaningful.
pub const ROUTE_HASH_SPACE: u64 = 100_000;

/// Stable routing hash for an id.
pub fn route_hash(id: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(id.as_bytes());
    hasher.finish() % ROUTE_HASH_SPACE
}

/// The message being routed, as seen by a strategy.
#[derive(Debug, Clone, Copy)]
pub struct RouteMessage<'a> {
    pub node_type: &'a str,
    pub service: &'a str,
    pub method: &'a str,
    pub params: &'a Value,
}

/// A target selection strategy.
///
/// Implementations must return either `None` (only when `candidates` yields
/// nothing suitable) or the id of a descriptor present in `candidates` -
/// never a synthesized id.
pub trait RouteStrategy: Send + Sync {
    fn select(
        &self,
        session: &Session,
        message: &RouteMessage<'_>,
        candidates: &[ServerDescriptor],
    ) -> Option<String>;
}

/// Affinity selection: hash the session's uid (or id) and walk the
/// candidates, sorted by routing hash, to the first whose hash is at least
/// the target; the last candidate catches the wrap-around.
///
/// Sorting makes the walk independent of the caller's iteration order; the
/// candidate set is small enough that sorting per call is cheaper than
/// maintaining a ring.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashRoute;

impl RouteStrategy for HashRoute {
    fn select(
        &self,
        session: &Session,
        _message: &RouteMessage<'_>,
        candidates: &[ServerDescriptor],
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let key = session.uid().unwrap_or_else(|| session.id());
        let target = route_hash(key);
        let mut ring: Vec<&ServerDescriptor> = candidates.iter().collect();
        ring.sort_by(|a, b| (a.route_hash, &a.id).cmp(&(b.route_hash, &b.id)));
        let chosen = ring
            .iter()
            .find(|candidate| candidate.route_hash >= target)
            .or_else(|| ring.last())?;
        Some(chosen.id.clone())
    }
}

/// Uniform random selection.
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleRoute;

impl RouteStrategy for SampleRoute {
    fn select(
        &self,
        _session: &Session,
        _message: &RouteMessage<'_>,
        candidates: &[ServerDescriptor],
    ) -> Option<String> {
        let mut rng = rand::thread_rng();
        candidates.choose(&mut rng).map(|c| c.id.clone())
    }
}

/// Per-target-type strategy table. Types without a registered strategy fall
/// back to [`HashRoute`].
#[derive(Clone)]
pub struct RouterTable {
    routes: Arc<RwLock<HashMap<String, Arc<dyn RouteStrategy>>>>,
    default: Arc<dyn RouteStrategy>,
}

impl Default for RouterTable {
    fn default() -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            default: Arc::new(HashRoute),
        }
    }
}

impl RouterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the strategy used for `node_type`.
    pub fn register(&self, node_type: &str, strategy: Arc<dyn RouteStrategy>) {
        self.routes.write().insert(node_type.to_string(), strategy);
    }

    pub fn strategy_for(&self, node_type: &str) -> Arc<dyn RouteStrategy> {
        self.routes
            .read()
            .get(node_type)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(id: &str) -> ServerDescriptor {
        let mut d = ServerDescriptor::new(id, "127.0.0.1", "localhost", 7000, "game", "0.1.0");
        d.route_hash = route_hash(id);
        d
    }

    fn message<'a>(params: &'a Value) -> RouteMessage<'a> {
        RouteMessage {
            node_type: "game",
            service: "echo",
            method: "ping",
            params,
        }
    }

    #[test]
    fn route_hash_is_stable_and_bounded() {
        assert_eq!(route_hash("node-1"), route_hash("node-1"));
        for id in ["a", "b", "game-front-1", ""] {
            assert!(route_hash(id) < ROUTE_HASH_SPACE);
        }
    }

    #[test]
    fn strategies_return_member_of_candidates() {
        let params = json!({});
        let candidates = vec![descriptor("a"), descriptor("b"), descriptor("c")];
        let session = Session::with_id("s-1");
        for strategy in [&HashRoute as &dyn RouteStrategy, &SampleRoute] {
            let chosen = strategy
                .select(&session, &message(&params), &candidates)
                .expect("non-empty candidates must yield a target");
            assert!(candidates.iter().any(|c| c.id == chosen));
        }
    }

    #[test]
    fn strategies_return_none_for_empty_candidates() {
        let params = json!({});
        let session = Session::with_id("s-1");
        assert!(HashRoute.select(&session, &message(&params), &[]).is_none());
        assert!(SampleRoute
            .select(&session, &message(&params), &[])
            .is_none());
    }

    #[test]
    fn hash_route_is_deterministic_and_order_independent() {
        let params = json!({});
        let session = Session::with_id("some-session");
        let forward = vec![descriptor("a"), descriptor("b"), descriptor("c")];
        let reversed = vec![descriptor("c"), descriptor("b"), descriptor("a")];
        let first = HashRoute.select(&session, &message(&params), &forward);
        let second = HashRoute.select(&session, &message(&params), &reversed);
        assert_eq!(first, second);
    }

    #[test]
    fn hash_route_prefers_bound_uid_over_session_id() {
        let params = json!({});
        let candidates: Vec<ServerDescriptor> =
            (0..16).map(|i| descriptor(&format!("node-{i}"))).collect();
        let mut bound = Session::with_id("shared-id");
        bound.bind("user-42");
        let mut other = Session::with_id("different-id");
        other.bind("user-42");
        assert_eq!(
            HashRoute.select(&bound, &message(&params), &candidates),
            HashRoute.select(&other, &message(&params), &candidates),
        );
    }

    #[test]
    fn router_table_falls_back_to_hash() {
        let table = RouterTable::new();
        table.register("lobby", Arc::new(SampleRoute));
        let params = json!({});
        let session = Session::with_id("s");
        let candidates = vec![descriptor("only")];
        let chosen = table
            .strategy_for("game")
            .select(&session, &message(&params), &candidates);
        assert_eq!(chosen.as_deref(), Some("only"));
        assert!(table
            .strategy_for("lobby")
            .select(&session, &message(&params), &candidates)
            .is_some());
    }
}
