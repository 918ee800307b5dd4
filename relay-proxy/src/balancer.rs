//! Upstream node selection (spec §4.3).
//!
//! Grounded on the teacher's atomic round-robin cursor used for
//! `ConnPool`/pipeline-cache indexing (`AtomicU64` + `fetch_add`,
//! `Ordering::Relaxed`), generalized into a small strategy enum. Health
//! filtering reads [`relay_core::upstream::NodeRuntimeTable`] so an upstream
//! that the breaker has opened, or that active health checks have marked
//! down, is skipped without the balancer needing its own bookkeeping.

use rand::Rng;
use relay_core::upstream::{CircuitState, NodeRuntimeTable};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Minimum gap between "client IP empty, degrading to round-robin" log
/// lines for a single load balancer instance.
const EMPTY_IP_WARN_INTERVAL_MS: u64 = 60_000;

/// Load balancing strategy for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
    IpHash,
}

impl Strategy {
    pub fn from_upstream_type(t: &str) -> Self {
        match t {
            "chash" | "ip_hash" | "iphash" => Strategy::IpHash,
            "least_conn" | "least-connections" => Strategy::LeastConnections,
            "ewma" | "random" => Strategy::Random,
            "weighted" | "weighted_roundrobin" => Strategy::WeightedRoundRobin,
            _ => Strategy::RoundRobin,
        }
    }
}

/// A candidate node with its configured weight.
#[derive(Debug, Clone)]
pub struct Node {
    pub addr: String,
    pub weight: u32,
}

/// Picks a healthy node from an upstream's node list according to a
/// [`Strategy`]. One `LoadBalancer` is created per upstream and reused
/// across requests (owned by the worker, not per-request).
pub struct LoadBalancer {
    strategy: Strategy,
    nodes: Vec<Node>,
    /// Precomputed cumulative weights for O(log n) weighted pick; also
    /// doubles as the round-robin cursor range.
    total_weight: u32,
    rr_cursor: AtomicUsize,
    /// Epoch millis of the last "empty client IP" degrade warning, so
    /// IpHash's round-robin fallback logs at most once per interval.
    last_empty_ip_warn_ms: AtomicU64,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy, nodes: Vec<Node>) -> Self {
        let total_weight = nodes.iter().map(|n| n.weight.max(1)).sum();
        Self {
            strategy,
            nodes,
            total_weight,
            rr_cursor: AtomicUsize::new(0),
            last_empty_ip_warn_ms: AtomicU64::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Select a node. `client_key` is used by `IpHash` (client IP or any
    /// other sticky key); ignored by other strategies. `runtime` filters
    /// out nodes that are unhealthy or have an open circuit breaker.
    pub fn select(&self, client_key: &str, runtime: &NodeRuntimeTable) -> Option<&str> {
        let healthy: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| self.is_eligible(&n.addr, runtime))
            .collect();

        if healthy.is_empty() {
            // Degrade: if every node looks down, try them all anyway
            // rather than failing the request outright — a stale health
            // check shouldn't take the whole upstream offline.
            return self.nodes.first().map(|n| n.addr.as_str());
        }

        match self.strategy {
            Strategy::RoundRobin => {
                let i = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                Some(healthy[i].addr.as_str())
            }
            Strategy::WeightedRoundRobin => {
                let healthy_weight: u32 = healthy.iter().map(|n| n.weight.max(1)).sum();
                if healthy_weight == 0 {
                    return Some(healthy[0].addr.as_str());
                }
                let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed) as u32 % healthy_weight;
                let mut acc = 0u32;
                for n in &healthy {
                    acc += n.weight.max(1);
                    if cursor < acc {
                        return Some(n.addr.as_str());
                    }
                }
                Some(healthy.last().unwrap().addr.as_str())
            }
            Strategy::LeastConnections => healthy
                .iter()
                .min_by_key(|n| {
                    runtime
                        .get(&n.addr)
                        .map(|s| s.active_connections.load(Ordering::Relaxed))
                        .unwrap_or(0)
                })
                .map(|n| n.addr.as_str()),
            Strategy::Random => {
                let i = rand::thread_rng().gen_range(0..healthy.len());
                Some(healthy[i].addr.as_str())
            }
            Strategy::IpHash => {
                if client_key.is_empty() {
                    self.warn_empty_ip_once_per_interval();
                    let i = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                    return Some(healthy[i].addr.as_str());
                }
                let mut hasher = DefaultHasher::new();
                client_key.hash(&mut hasher);
                let i = (hasher.finish() as usize) % healthy.len();
                Some(healthy[i].addr.as_str())
            }
        }
    }

    /// IpHash with no client IP available degrades to round-robin (spec
    /// §4.3); log that at most once per [`EMPTY_IP_WARN_INTERVAL_MS`] rather
    /// than on every request from a client that never sends one.
    fn warn_empty_ip_once_per_interval(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let last = self.last_empty_ip_warn_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= EMPTY_IP_WARN_INTERVAL_MS
            && self
                .last_empty_ip_warn_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            tracing::warn!("ip-hash load balancing: client IP empty, degrading to round-robin");
        }
    }

    fn is_eligible(&self, addr: &str, runtime: &NodeRuntimeTable) -> bool {
        match runtime.get(addr) {
            Some(state) => state.is_healthy() && state.circuit_state() != CircuitState::Open,
            None => true, // never probed yet — assume eligible
        }
    }

    pub fn total_weight(&self) -> u32 {
        self.total_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(pairs: &[(&str, u32)]) -> Vec<Node> {
        pairs
            .iter()
            .map(|(a, w)| Node {
                addr: a.to_string(),
                weight: *w,
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_through_all_nodes() {
        let lb = LoadBalancer::new(Strategy::RoundRobin, nodes(&[("a", 1), ("b", 1), ("c", 1)]));
        let runtime = NodeRuntimeTable::new();
        let picks: Vec<&str> = (0..6).map(|_| lb.select("x", &runtime).unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn weighted_round_robin_favors_higher_weight() {
        let lb = LoadBalancer::new(Strategy::WeightedRoundRobin, nodes(&[("a", 3), ("b", 1)]));
        let runtime = NodeRuntimeTable::new();
        let picks: Vec<&str> = (0..4).map(|_| lb.select("x", &runtime).unwrap()).collect();
        let a_count = picks.iter().filter(|&&p| p == "a").count();
        assert_eq!(a_count, 3);
    }

    #[test]
    fn ip_hash_is_sticky_for_the_same_key() {
        let lb = LoadBalancer::new(Strategy::IpHash, nodes(&[("a", 1), ("b", 1), ("c", 1)]));
        let runtime = NodeRuntimeTable::new();
        let first = lb.select("10.0.0.5", &runtime).unwrap().to_string();
        for _ in 0..5 {
            assert_eq!(lb.select("10.0.0.5", &runtime).unwrap(), first);
        }
    }

    #[test]
    fn ip_hash_with_empty_client_key_degrades_to_round_robin() {
        let lb = LoadBalancer::new(Strategy::IpHash, nodes(&[("a", 1), ("b", 1), ("c", 1)]));
        let runtime = NodeRuntimeTable::new();
        let picks: Vec<&str> = (0..6).map(|_| lb.select("", &runtime).unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn least_connections_picks_the_idlest_node() {
        let lb = LoadBalancer::new(Strategy::LeastConnections, nodes(&[("a", 1), ("b", 1)]));
        let runtime = NodeRuntimeTable::new();
        runtime.get_or_init("a").incr_active();
        runtime.get_or_init("a").incr_active();
        let picked = lb.select("x", &runtime).unwrap();
        assert_eq!(picked, "b");
    }

    #[test]
    fn unhealthy_node_is_skipped() {
        let lb = LoadBalancer::new(Strategy::RoundRobin, nodes(&[("a", 1), ("b", 1)]));
        let runtime = NodeRuntimeTable::new();
        runtime
            .get_or_init("a")
            .healthy
            .store(false, Ordering::Relaxed);
        for _ in 0..4 {
            assert_eq!(lb.select("x", &runtime).unwrap(), "b");
        }
    }

    #[test]
    fn all_nodes_down_degrades_to_first_node_rather_than_failing() {
        let lb = LoadBalancer::new(Strategy::RoundRobin, nodes(&[("a", 1)]));
        let runtime = NodeRuntimeTable::new();
        runtime
            .get_or_init("a")
            .healthy
            .store(false, Ordering::Relaxed);
        assert_eq!(lb.select("x", &runtime), Some("a"));
    }

    #[test]
    fn empty_node_list_selects_nothing() {
        let lb = LoadBalancer::new(Strategy::RoundRobin, vec![]);
        let runtime = NodeRuntimeTable::new();
        assert!(lb.is_empty());
        assert_eq!(lb.select("x", &runtime), None);
    }
}
