use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Upstream target definition — APISIX-compatible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub id: Option<String>,

    /// Upstream name.
    pub name: Option<String>,

    /// Load balancer type: roundrobin, chash, ewma.
    #[serde(default = "default_lb_type", rename = "type")]
    pub lb_type: String,

    /// Nodes: address → weight.
    #[serde(default)]
    pub nodes: HashMap<String, u32>,

    /// Health check config.
    pub health_check: Option<HealthCheck>,

    /// Connection timeout override (ms).
    pub connect_timeout_ms: Option<u64>,

    /// Read/write timeouts (ms).
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,

    /// Pass host mode: "pass" | "node" | "rewrite".
    #[serde(default = "default_pass_host")]
    pub pass_host: String,

    /// Upstream host header (used when pass_host = "rewrite").
    pub upstream_host: Option<String>,

    /// Retries on upstream failure.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Description.
    pub desc: Option<String>,

    /// Labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub active: Option<ActiveHealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHealthCheck {
    #[serde(default = "default_hc_type")]
    pub r#type: String,
    #[serde(default = "default_hc_interval")]
    pub interval: u64,
    #[serde(default = "default_hc_timeout")]
    pub timeout: u64,
    pub http_path: Option<String>,
    #[serde(default = "default_healthy_successes")]
    pub healthy_successes: u32,
    #[serde(default = "default_unhealthy_failures")]
    pub unhealthy_failures: u32,
}

fn default_lb_type() -> String { "roundrobin".into() }
fn default_pass_host() -> String { "pass".into() }
fn default_retries() -> u32 { 1 }
fn default_hc_type() -> String { "http".into() }
fn default_hc_interval() -> u64 { 5 }
fn default_hc_timeout() -> u64 { 3 }
fn default_healthy_successes() -> u32 { 2 }
fn default_unhealthy_failures() -> u32 { 3 }

impl Upstream {
    /// Get the first node address (for single-node upstreams).
    pub fn first_node(&self) -> Option<&str> {
        self.nodes.keys().next().map(|s| s.as_str())
    }

    /// Returns true if there are no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node addresses, in no particular order.
    pub fn node_addrs(&self) -> Vec<&str> {
        self.nodes.keys().map(|s| s.as_str()).collect()
    }
}

/// Circuit breaker states, encoded as a `u8` so they fit in an `AtomicU8`.
/// The state machine transitions themselves live in `relay-proxy`'s
/// breaker — this is just the shared memory cell it operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Mutable runtime state for one upstream node (spec §3 `UpstreamTarget`).
///
/// Kept separate from the serde-derived `Upstream` config struct: atomics
/// aren't `Clone` or `Serialize`, and config snapshots (passed around by
/// value, rebuilt on every config sync) need to stay cheap to clone. This
/// struct instead lives behind an `Arc` in a [`NodeRuntimeTable`], shared
/// between the health checker, load balancer, and circuit breaker so none
/// of them need to go back through a config lookup on the hot path.
#[derive(Debug)]
pub struct NodeRuntimeState {
    pub healthy: AtomicBool,
    pub active_connections: AtomicUsize,
    pub breaker_state: AtomicU8,
    pub consecutive_failures: AtomicU32,
    pub consecutive_successes: AtomicU32,
    /// Monotonic nanosecond timestamp of the last state transition, used by
    /// the breaker to decide when to move from Open to HalfOpen.
    pub last_transition_ns: AtomicU32,
    /// Number of probe requests currently admitted while HalfOpen. Bounds
    /// how many trial requests run concurrently before the breaker decides
    /// whether to close or reopen.
    pub half_open_probes_in_flight: AtomicU32,
    /// Monotonic milliseconds of the first failure in the current failure
    /// streak; 0 means no streak is open. The health checker requires this
    /// to age past `gracePeriod` before flipping a node unhealthy, so a
    /// brief blip doesn't immediately pull a node out of rotation.
    pub first_failure_ms: AtomicU64,
}

impl NodeRuntimeState {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
            breaker_state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            last_transition_ns: AtomicU32::new(0),
            half_open_probes_in_flight: AtomicU32::new(0),
            first_failure_ms: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn circuit_state(&self) -> CircuitState {
        CircuitState::from_u8(self.breaker_state.load(Ordering::Acquire))
    }

    pub fn incr_active(&self) -> usize {
        self.active_connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decr_active(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-upstream table of [`NodeRuntimeState`], keyed by node address.
/// Entries are created lazily and never removed on a request path — only
/// a config sync (which rebuilds the owning worker's upstream set) prunes
/// stale addresses.
#[derive(Debug, Default)]
pub struct NodeRuntimeTable {
    nodes: DashMap<String, Arc<NodeRuntimeState>>,
}

impl NodeRuntimeTable {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// Get or create the runtime state for a node address.
    pub fn get_or_init(&self, addr: &str) -> Arc<NodeRuntimeState> {
        if let Some(state) = self.nodes.get(addr) {
            return Arc::clone(&state);
        }
        let state = Arc::new(NodeRuntimeState::new());
        self.nodes.insert(addr.to_string(), Arc::clone(&state));
        state
    }

    pub fn get(&self, addr: &str) -> Option<Arc<NodeRuntimeState>> {
        self.nodes.get(addr).map(|s| Arc::clone(&s))
    }

    /// Drop entries for addresses no longer present in `live_addrs`.
    pub fn retain_only(&self, live_addrs: &[&str]) {
        self.nodes.retain(|k, _| live_addrs.contains(&k.as_str()));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_upstream(nodes: Vec<(&str, u32)>) -> Upstream {
        Upstream {
            id: Some("us1".into()),
            name: Some("test".into()),
            lb_type: "roundrobin".into(),
            nodes: nodes.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            health_check: None,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            write_timeout_ms: None,
            pass_host: "pass".into(),
            upstream_host: None,
            retries: 1,
            desc: None,
            labels: Default::default(),
        }
    }

    #[test]
    fn test_first_node_empty() {
        let us = make_upstream(vec![]);
        assert!(us.first_node().is_none());
        assert!(us.is_empty());
    }

    #[test]
    fn test_first_node_single() {
        let us = make_upstream(vec![("127.0.0.1:8080", 1)]);
        assert_eq!(us.first_node(), Some("127.0.0.1:8080"));
        assert!(!us.is_empty());
    }

    #[test]
    fn test_defaults_from_serde() {
        let json = r#"{"nodes":{"127.0.0.1:8080":1}}"#;
        let us: Upstream = serde_json::from_str(json).unwrap();
        assert_eq!(us.lb_type, "roundrobin");
        assert_eq!(us.pass_host, "pass");
        assert_eq!(us.retries, 1);
    }

    #[test]
    fn test_serde_roundtrip_multiple_nodes() {
        let us = make_upstream(vec![("10.0.0.1:9000", 100), ("10.0.0.2:9000", 50)]);
        let json = serde_json::to_string(&us).unwrap();
        let decoded: Upstream = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.nodes.len(), 2);
        assert_eq!(decoded.nodes.get("10.0.0.1:9000"), Some(&100));
        assert_eq!(decoded.nodes.get("10.0.0.2:9000"), Some(&50));
    }

    #[test]
    fn test_weighted_nodes() {
        let us = make_upstream(vec![("a:80", 10), ("b:80", 20), ("c:80", 30)]);
        assert_eq!(us.nodes.len(), 3);
        assert_eq!(us.nodes["a:80"], 10);
        assert_eq!(us.nodes["b:80"], 20);
        assert_eq!(us.nodes["c:80"], 30);
    }

    #[test]
    fn test_health_check_defaults() {
        let json = r#"{"nodes":{"127.0.0.1:8080":1},"health_check":{"active":{}}}"#;
        let us: Upstream = serde_json::from_str(json).unwrap();
        let hc = us.health_check.unwrap();
        let active = hc.active.unwrap();
        assert_eq!(active.r#type, "http");
        assert_eq!(active.interval, 5);
        assert_eq!(active.timeout, 3);
        assert_eq!(active.healthy_successes, 2);
        assert_eq!(active.unhealthy_failures, 3);
    }

    #[test]
    fn node_runtime_table_initializes_healthy_and_closed() {
        let table = NodeRuntimeTable::new();
        let state = table.get_or_init("10.0.0.1:8080");
        assert!(state.is_healthy());
        assert_eq!(state.circuit_state(), CircuitState::Closed);
        assert_eq!(state.active_connections.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn node_runtime_table_get_or_init_is_idempotent() {
        let table = NodeRuntimeTable::new();
        let a = table.get_or_init("10.0.0.1:8080");
        a.incr_active();
        let b = table.get_or_init("10.0.0.1:8080");
        assert_eq!(b.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn node_runtime_table_retain_only_prunes_stale_addresses() {
        let table = NodeRuntimeTable::new();
        table.get_or_init("a:80");
        table.get_or_init("b:80");
        table.retain_only(&["a:80"]);
        assert_eq!(table.len(), 1);
        assert!(table.get("b:80").is_none());
    }

    #[test]
    fn incr_decr_active_tracks_connection_count() {
        let table = NodeRuntimeTable::new();
        let state = table.get_or_init("a:80");
        state.incr_active();
        state.incr_active();
        state.decr_active();
        assert_eq!(state.active_connections.load(Ordering::Relaxed), 1);
    }
}
