//! The metrics aggregator (spec §4.15).
//!
//! Atomic counters for request/error/byte/connection totals, a bucketed
//! latency histogram supporting p50/p95/p99 extraction, and per-route /
//! per-upstream roll-ups (count, errors, latency, bytes, status-code
//! distribution). Every counter here is designed to be hammered
//! concurrently from every proxy worker thread without a shared lock on the
//! hot path — the only locking is the per-route/per-upstream status-code
//! map, which is small and short-held.
//!
//! A `prometheus::Registry` is kept alongside the atomic counters purely for
//! the `/metrics` text-exposition endpoint; the atomics are the source of
//! truth read by the JSON admin API (`/api/metrics/*`).

use relay_core::error::ErrorCategory;
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Upper bound (inclusive) of each latency histogram bucket, in milliseconds.
/// Requests slower than the last bucket land in an implicit "+Inf" overflow
/// bucket at index `LATENCY_BUCKETS_MS.len()`.
const LATENCY_BUCKETS_MS: &[u64] = &[1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000];

const ERROR_CATEGORIES: &[ErrorCategory] = &[
    ErrorCategory::Client,
    ErrorCategory::Server,
    ErrorCategory::Network,
    ErrorCategory::Timeout,
    ErrorCategory::CircuitBreaker,
    ErrorCategory::Transformation,
    ErrorCategory::Other,
];

fn category_label(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::Client => "client",
        ErrorCategory::Server => "server",
        ErrorCategory::Network => "network",
        ErrorCategory::Timeout => "timeout",
        ErrorCategory::CircuitBreaker => "circuit_breaker",
        ErrorCategory::Transformation => "transformation",
        ErrorCategory::Other => "other",
    }
}

fn category_index(cat: ErrorCategory) -> usize {
    ERROR_CATEGORIES
        .iter()
        .position(|c| *c == cat)
        .unwrap_or(ERROR_CATEGORIES.len() - 1)
}

/// A lock-free latency histogram. Bucket counts are `AtomicU64`; `observe`
/// is a handful of relaxed stores, safe to call from any worker thread.
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    total_count: AtomicU64,
    total_sum_ms: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS_MS.len()).map(|_| AtomicU64::new(0)).collect(),
            total_count: AtomicU64::new(0),
            total_sum_ms: AtomicU64::new(0),
        }
    }

    fn observe(&self, latency_ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| latency_ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.total_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    fn avg_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.total_sum_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Extract the latency bound below which `p` fraction of observations
    /// fall (e.g. `p = 0.99` for p99), by walking the cumulative bucket
    /// counts. Approximate — bucket boundaries, not exact order statistics —
    /// the same way `histogram_quantile` works in Prometheus.
    fn percentile(&self, p: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let target = ((p * total as f64).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return *LATENCY_BUCKETS_MS
                    .get(i)
                    .unwrap_or_else(|| LATENCY_BUCKETS_MS.last().unwrap());
            }
        }
        *LATENCY_BUCKETS_MS.last().unwrap()
    }

    fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    fn p95(&self) -> u64 {
        self.percentile(0.95)
    }

    fn p99(&self) -> u64 {
        self.percentile(0.99)
    }
}

/// Request-count / error-count / latency / byte roll-up for one route or
/// upstream key.
struct Rollup {
    requests: AtomicU64,
    errors: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latency: Histogram,
    status_codes: Mutex<HashMap<u16, u64>>,
}

impl Rollup {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            latency: Histogram::new(),
            status_codes: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, status: u16, is_error: bool, latency_ms: u64, bytes_in: u64, bytes_out: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.latency.observe(latency_ms);
        *self.status_codes.lock().entry(status).or_insert(0) += 1;
    }

    fn snapshot(&self) -> RollupSnapshot {
        RollupSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            avg_latency_ms: self.latency.avg_ms(),
            p50_ms: self.latency.p50(),
            p95_ms: self.latency.p95(),
            p99_ms: self.latency.p99(),
            status_codes: self.status_codes.lock().clone(),
        }
    }
}

/// JSON-serializable view of a route/upstream roll-up for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct RollupSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_latency_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub status_codes: HashMap<u16, u64>,
}

/// Overall gateway-wide summary, as returned by `GET /api/metrics/summary`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub total_errors: u64,
    pub errors_by_category: HashMap<&'static str, u64>,
    pub active_connections: i64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub avg_latency_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// The process-wide metrics aggregator. One instance is shared (via `Arc`)
/// across every proxy worker thread and the admin API.
pub struct Aggregator {
    total_requests: AtomicU64,
    active_connections: AtomicI64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors_by_category: [AtomicU64; 7],
    latency: Histogram,
    routes: DashMap<String, Arc<Rollup>>,
    upstreams: DashMap<String, Arc<Rollup>>,

    registry: Registry,
    prom_requests_total: IntCounterVec,
    prom_errors_total: IntCounterVec,
    prom_request_duration: HistogramVec,
    prom_active_connections: IntGauge,
    prom_bytes_sent: IntCounter,
    prom_bytes_received: IntCounter,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        let registry = Registry::new();

        let prom_requests_total = IntCounterVec::new(
            Opts::new("gateway_http_requests_total", "Total HTTP requests processed"),
            &["route", "method", "status"],
        )
        .expect("valid metric");
        let prom_errors_total = IntCounterVec::new(
            Opts::new("gateway_errors_total", "Total errors by category"),
            &["category"],
        )
        .expect("valid metric");
        let prom_request_duration = HistogramVec::new(
            HistogramOpts::new("gateway_http_request_duration_seconds", "Request latency")
                .buckets(LATENCY_BUCKETS_MS.iter().map(|ms| *ms as f64 / 1000.0).collect()),
            &["route"],
        )
        .expect("valid metric");
        let prom_active_connections =
            IntGauge::new("gateway_active_connections", "Currently open client connections")
                .expect("valid metric");
        let prom_bytes_sent =
            IntCounter::new("gateway_bytes_sent_total", "Total bytes written to clients")
                .expect("valid metric");
        let prom_bytes_received =
            IntCounter::new("gateway_bytes_received_total", "Total bytes read from clients")
                .expect("valid metric");

        registry
            .register(Box::new(prom_requests_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(prom_errors_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(prom_request_duration.clone()))
            .expect("register metric");
        registry
            .register(Box::new(prom_active_connections.clone()))
            .expect("register metric");
        registry
            .register(Box::new(prom_bytes_sent.clone()))
            .expect("register metric");
        registry
            .register(Box::new(prom_bytes_received.clone()))
            .expect("register metric");

        Self {
            total_requests: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors_by_category: Default::default(),
            latency: Histogram::new(),
            routes: DashMap::new(),
            upstreams: DashMap::new(),
            registry,
            prom_requests_total,
            prom_errors_total,
            prom_request_duration,
            prom_active_connections,
            prom_bytes_sent,
            prom_bytes_received,
        }
    }

    /// Record one completed request. `error_category` is `None` for a
    /// successful (non-error) response.
    #[allow(clippy::too_many_arguments)]
    pub fn record_request(
        &self,
        route_id: &str,
        upstream_key: Option<&str>,
        method: &str,
        status: u16,
        latency_ms: u64,
        bytes_in: u64,
        bytes_out: u64,
        error_category: Option<ErrorCategory>,
    ) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_out, Ordering::Relaxed);
        self.latency.observe(latency_ms);

        if let Some(cat) = error_category {
            self.errors_by_category[category_index(cat)].fetch_add(1, Ordering::Relaxed);
            self.prom_errors_total.with_label_values(&[category_label(cat)]).inc();
        }

        self.prom_requests_total
            .with_label_values(&[route_id, method, &status.to_string()])
            .inc();
        self.prom_request_duration
            .with_label_values(&[route_id])
            .observe(latency_ms as f64 / 1000.0);

        let is_error = error_category.is_some();
        self.routes
            .entry(route_id.to_string())
            .or_insert_with(|| Arc::new(Rollup::new()))
            .record(status, is_error, latency_ms, bytes_in, bytes_out);

        if let Some(key) = upstream_key {
            self.upstreams
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Rollup::new()))
                .record(status, is_error, latency_ms, bytes_in, bytes_out);
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.prom_active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.prom_active_connections.dec();
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> MetricsSummary {
        let mut errors_by_category = HashMap::new();
        let mut total_errors = 0u64;
        for (i, cat) in ERROR_CATEGORIES.iter().enumerate() {
            let n = self.errors_by_category[i].load(Ordering::Relaxed);
            total_errors += n;
            errors_by_category.insert(category_label(*cat), n);
        }

        MetricsSummary {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors,
            errors_by_category,
            active_connections: self.active_connections(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            avg_latency_ms: self.latency.avg_ms(),
            p50_ms: self.latency.p50(),
            p95_ms: self.latency.p95(),
            p99_ms: self.latency.p99(),
        }
    }

    pub fn route_snapshot(&self, route_id: &str) -> Option<RollupSnapshot> {
        self.routes.get(route_id).map(|r| r.snapshot())
    }

    pub fn all_route_snapshots(&self) -> HashMap<String, RollupSnapshot> {
        self.routes.iter().map(|e| (e.key().clone(), e.value().snapshot())).collect()
    }

    pub fn upstream_snapshot(&self, upstream_key: &str) -> Option<RollupSnapshot> {
        self.upstreams.get(upstream_key).map(|r| r.snapshot())
    }

    pub fn all_upstream_snapshots(&self) -> HashMap<String, RollupSnapshot> {
        self.upstreams.iter().map(|e| (e.key().clone(), e.value().snapshot())).collect()
    }

    /// Render every registered metric as Prometheus text exposition format,
    /// for the `GET /metrics` admin endpoint.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .expect("prometheus encoding never fails for well-formed metrics");
        String::from_utf8(buffer).expect("prometheus output is always valid utf8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_total_requests_and_bytes() {
        let agg = Aggregator::new();
        agg.record_request("r1", Some("u1:80"), "GET", 200, 42, 100, 200, None);
        agg.record_request("r1", Some("u1:80"), "GET", 200, 10, 50, 150, None);

        let summary = agg.summary();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.bytes_received, 150);
        assert_eq!(summary.bytes_sent, 350);
        assert_eq!(summary.total_errors, 0);
    }

    #[test]
    fn categorizes_errors() {
        let agg = Aggregator::new();
        agg.record_request("r1", None, "GET", 502, 5, 0, 0, Some(ErrorCategory::Server));
        agg.record_request("r1", None, "GET", 429, 1, 0, 0, Some(ErrorCategory::Client));

        let summary = agg.summary();
        assert_eq!(summary.total_errors, 2);
        assert_eq!(summary.errors_by_category["server"], 1);
        assert_eq!(summary.errors_by_category["client"], 1);
        assert_eq!(summary.errors_by_category["network"], 0);
    }

    #[test]
    fn route_rollup_tracks_status_code_distribution() {
        let agg = Aggregator::new();
        for _ in 0..3 {
            agg.record_request("r1", None, "GET", 200, 10, 0, 0, None);
        }
        agg.record_request("r1", None, "GET", 500, 10, 0, 0, Some(ErrorCategory::Server));

        let snap = agg.route_snapshot("r1").unwrap();
        assert_eq!(snap.requests, 4);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.status_codes[&200], 3);
        assert_eq!(snap.status_codes[&500], 1);
    }

    #[test]
    fn upstream_rollup_is_independent_of_route_rollup() {
        let agg = Aggregator::new();
        agg.record_request("route-a", Some("up-1"), "GET", 200, 5, 0, 0, None);
        agg.record_request("route-b", Some("up-1"), "GET", 200, 5, 0, 0, None);

        assert_eq!(agg.upstream_snapshot("up-1").unwrap().requests, 2);
        assert_eq!(agg.route_snapshot("route-a").unwrap().requests, 1);
        assert_eq!(agg.route_snapshot("route-b").unwrap().requests, 1);
    }

    #[test]
    fn connection_gauge_tracks_open_and_close() {
        let agg = Aggregator::new();
        agg.connection_opened();
        agg.connection_opened();
        agg.connection_closed();
        assert_eq!(agg.active_connections(), 1);
    }

    #[test]
    fn histogram_percentiles_reflect_observed_latencies() {
        let hist = Histogram::new();
        for _ in 0..90 {
            hist.observe(10);
        }
        for _ in 0..9 {
            hist.observe(100);
        }
        hist.observe(5000);

        assert_eq!(hist.p50(), 10);
        assert!(hist.p95() >= 100);
        assert!(hist.p99() >= 100);
    }

    #[test]
    fn histogram_with_no_observations_returns_zero() {
        let hist = Histogram::new();
        assert_eq!(hist.p50(), 0);
        assert_eq!(hist.avg_ms(), 0.0);
    }

    #[test]
    fn gather_text_includes_registered_metric_names() {
        let agg = Aggregator::new();
        agg.record_request("r1", None, "GET", 200, 1, 0, 0, None);
        let text = agg.gather_text();
        assert!(text.contains("gateway_http_requests_total"));
        assert!(text.contains("gateway_active_connections"));
    }
}
