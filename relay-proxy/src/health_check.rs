//! Health checking (spec §4.5): active probes plus passive outcome
//! recording, writing directly into the shared [`NodeRuntimeState`]
//! atomics so the load balancer and circuit breaker see the same picture
//! either mode would produce.
//!
//! Runs on the same monoio runtime as the data plane — a raw HTTP/1.1
//! request is hand-built and sent over a plain `monoio::net::TcpStream`,
//! mirroring `connection.rs`'s upstream-connection handling rather than
//! pulling in a tokio-based client that would not run on this executor.

use relay_core::upstream::{ActiveHealthCheck, NodeRuntimeState, NodeRuntimeTable};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::connection::new_upstream_conn;

/// Health status as seen from outside, including the degraded
/// intermediate the state machine allows (spec §4.5) when neither
/// threshold has been crossed but one streak is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Current monotonic wall-clock milliseconds, used as the grace-period
/// clock. A real monotonic clock would be preferable to `SystemTime`, but
/// this gateway has no other monotonic-ms source wired through yet and
/// `SystemTime` is adequate for a grace window measured in seconds.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Spawn an active health-check loop for one upstream's node set.
///
/// Consecutive success/failure counts live on each node's own
/// `NodeRuntimeState` (`consecutive_successes` / `consecutive_failures`),
/// so a probe result composes with passive failures observed on the
/// request path instead of keeping a second, disjoint tally.
pub fn spawn_active_check(
    upstream_id: String,
    nodes: Vec<String>,
    config: ActiveHealthCheck,
    node_runtime: Arc<NodeRuntimeTable>,
) {
    monoio::spawn(async move {
        let interval = Duration::from_secs(config.interval.max(1));
        let http_path = config.http_path.clone().unwrap_or_else(|| "/".to_string());
        let grace_period_ms = config.interval.max(1) * 1000;

        loop {
            monoio::time::sleep(interval).await;

            for node in &nodes {
                let state = node_runtime.get_or_init(node);
                let healthy = probe_once(node, &http_path, config.timeout).await;
                record_outcome(
                    &upstream_id,
                    node,
                    &state,
                    healthy,
                    config.healthy_successes,
                    config.unhealthy_failures,
                    grace_period_ms,
                );
            }
        }
    });
}

/// Record the outcome of a real proxied request against `node` (spec
/// §4.5's passive mode). Called from the connection-handling hot path
/// after an upstream call completes or fails, complementing the active
/// probe loop above with the same state-machine rules.
pub fn record_passive_outcome(
    upstream_id: &str,
    node: &str,
    state: &NodeRuntimeState,
    success: bool,
    healthy_successes: u32,
    unhealthy_failures: u32,
    grace_period_ms: u64,
) {
    record_outcome(
        upstream_id,
        node,
        state,
        success,
        healthy_successes,
        unhealthy_failures,
        grace_period_ms,
    );
}

/// Shared success/failure bookkeeping for both active and passive modes.
///
/// healthy → unhealthy requires BOTH the consecutive-failure threshold and
/// `now >= first-failure + gracePeriod`; unhealthy → healthy only needs
/// the consecutive-success threshold. A streak that hasn't crossed either
/// threshold yet is reported as `Degraded` via [`status_of`].
fn record_outcome(
    upstream_id: &str,
    node: &str,
    state: &NodeRuntimeState,
    success: bool,
    healthy_successes: u32,
    unhealthy_failures: u32,
    grace_period_ms: u64,
) {
    if success {
        state.consecutive_failures.store(0, Ordering::Release);
        state.first_failure_ms.store(0, Ordering::Release);
        let successes = state.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes >= healthy_successes && !state.is_healthy() {
            debug!(upstream = %upstream_id, node = %node, "Node recovered, marking healthy");
            state.healthy.store(true, Ordering::Release);
        }
    } else {
        state.consecutive_successes.store(0, Ordering::Release);
        let failures = state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures == 1 {
            state.first_failure_ms.store(now_ms(), Ordering::Release);
        }
        let first_failure = state.first_failure_ms.load(Ordering::Acquire);
        let past_grace = first_failure != 0 && now_ms() >= first_failure + grace_period_ms;

        if failures >= unhealthy_failures && past_grace && state.is_healthy() {
            warn!(upstream = %upstream_id, node = %node, "Node marked unhealthy");
            state.healthy.store(false, Ordering::Release);
        }
    }
}

/// Derive the degraded-aware status spec §4.5 describes, for admin/metrics
/// surfaces that want more granularity than the boolean `healthy` flag.
pub fn status_of(state: &NodeRuntimeState, unhealthy_failures: u32, healthy_successes: u32) -> HealthStatus {
    let failures = state.consecutive_failures.load(Ordering::Acquire);
    let successes = state.consecutive_successes.load(Ordering::Acquire);

    if !state.is_healthy() {
        return HealthStatus::Unhealthy;
    }
    if failures > 0 && failures < unhealthy_failures {
        return HealthStatus::Degraded;
    }
    if successes > 0 && successes < healthy_successes {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

/// Send a minimal HTTP/1.1 GET to `node`, returning true iff it connects and
/// responds with a status below 500 within `timeout_secs`.
async fn probe_once(node: &str, http_path: &str, timeout_secs: u64) -> bool {
    let probe = async {
        let mut stream = match new_upstream_conn(node).await {
            Some(s) => s,
            None => return false,
        };

        let req = format!(
            "GET {http_path} HTTP/1.1\r\nHost: {node}\r\nConnection: close\r\nUser-Agent: relay-health-check\r\n\r\n"
        );
        use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
        let (res, _) = stream.write_all(req.into_bytes()).await;
        if res.is_err() {
            return false;
        }

        let buf = vec![0u8; 1024];
        let (res, buf) = stream.read(buf).await;
        let n = match res {
            Ok(n) if n > 0 => n,
            _ => return false,
        };

        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(&buf[..n]) {
            Ok(httparse::Status::Complete(_)) | Ok(httparse::Status::Partial) => {
                matches!(resp.code, Some(code) if code < 500)
            }
            Err(_) => false,
        }
    };

    match monoio::time::timeout(Duration::from_secs(timeout_secs.max(1)), probe).await {
        Ok(healthy) => healthy,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::upstream::NodeRuntimeTable;

    #[test]
    fn failure_below_threshold_keeps_node_healthy_but_degraded() {
        let table = NodeRuntimeTable::new();
        let state = table.get_or_init("a:80");
        record_outcome("u1", "a:80", &state, false, 2, 3, 0);
        assert!(state.is_healthy());
        assert_eq!(status_of(&state, 3, 2), HealthStatus::Degraded);
    }

    #[test]
    fn failure_at_threshold_without_grace_elapsed_stays_healthy() {
        let table = NodeRuntimeTable::new();
        let state = table.get_or_init("a:80");
        // Large grace period that can't have elapsed between these calls.
        for _ in 0..5 {
            record_outcome("u1", "a:80", &state, false, 2, 3, 60_000);
        }
        assert!(state.is_healthy(), "grace period not yet elapsed");
    }

    #[test]
    fn failure_at_threshold_with_zero_grace_flips_unhealthy() {
        let table = NodeRuntimeTable::new();
        let state = table.get_or_init("a:80");
        for _ in 0..3 {
            record_outcome("u1", "a:80", &state, false, 2, 3, 0);
        }
        assert!(!state.is_healthy());
    }

    #[test]
    fn success_after_unhealthy_requires_success_threshold() {
        let table = NodeRuntimeTable::new();
        let state = table.get_or_init("a:80");
        for _ in 0..3 {
            record_outcome("u1", "a:80", &state, false, 2, 3, 0);
        }
        assert!(!state.is_healthy());

        record_outcome("u1", "a:80", &state, true, 2, 3, 0);
        assert!(!state.is_healthy(), "one success below threshold");

        record_outcome("u1", "a:80", &state, true, 2, 3, 0);
        assert!(state.is_healthy(), "two successes crosses threshold");
    }

    #[test]
    fn success_resets_failure_streak_and_first_failure_timestamp() {
        let table = NodeRuntimeTable::new();
        let state = table.get_or_init("a:80");
        record_outcome("u1", "a:80", &state, false, 2, 3, 60_000);
        assert!(state.first_failure_ms.load(Ordering::Acquire) > 0);

        record_outcome("u1", "a:80", &state, true, 2, 3, 60_000);
        assert_eq!(state.consecutive_failures.load(Ordering::Acquire), 0);
        assert_eq!(state.first_failure_ms.load(Ordering::Acquire), 0);
    }

    #[test]
    fn status_of_healthy_node_with_no_streaks() {
        let table = NodeRuntimeTable::new();
        let state = table.get_or_init("a:80");
        assert_eq!(status_of(&state, 3, 2), HealthStatus::Healthy);
    }
}
