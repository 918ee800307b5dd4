use relay_plugin::plugin::{Phase, Plugin, PluginContext, PluginInstance, PluginResult};
use relay_core::lru::LruKeyMap;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Sliding-window-log rate limiter: keeps the arrival timestamp of every
/// request within the trailing window and rejects once the count in that
/// rolling window exceeds the limit. More precise than `rate-limiting`'s
/// token bucket at small windows (no burst averaging artifacts) at the
/// cost of O(window size) memory per key instead of O(1); the same
/// `LruKeyMap` discipline bounds the key space.
pub struct SlidingWindowPlugin;

#[derive(Debug, Deserialize, Clone)]
struct SlidingWindowConfig {
    #[serde(default = "default_max_requests")]
    max_requests: u64,
    #[serde(default = "default_window_secs")]
    window_secs: u64,
    #[serde(default = "default_limit_by")]
    limit_by: String,
    #[serde(default = "default_message")]
    message: String,
    #[serde(default = "default_max_keys")]
    max_keys: usize,
}

fn default_max_requests() -> u64 {
    60
}
fn default_window_secs() -> u64 {
    60
}
fn default_limit_by() -> String {
    "ip".to_string()
}
fn default_message() -> String {
    "Rate limit exceeded".to_string()
}
fn default_max_keys() -> usize {
    100_000
}

struct SlidingWindowInstance {
    max_requests: u64,
    window_secs: u64,
    limit_by: String,
    message: String,
    logs: DashMap<String, Mutex<VecDeque<Instant>>>,
    recency: LruKeyMap<String>,
}

impl Plugin for SlidingWindowPlugin {
    fn name(&self) -> &str {
        "sliding-window-limit"
    }

    fn priority(&self) -> i32 {
        1002
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let cfg: SlidingWindowConfig = serde_json::from_value(config.clone())?;
        Ok(Box::new(SlidingWindowInstance {
            max_requests: cfg.max_requests,
            window_secs: cfg.window_secs,
            limit_by: cfg.limit_by,
            message: cfg.message,
            logs: DashMap::new(),
            recency: LruKeyMap::new(cfg.max_keys),
        }))
    }
}

impl SlidingWindowInstance {
    /// Consume `cost` slots in the window for `key`. Returns `(allowed,
    /// remaining, retry_after_secs)`. Per spec, `retry_after = oldest +
    /// windowMs - now` when denied: the window only has room again once
    /// its oldest entry ages out.
    fn consume(&self, key: &str, cost: u64) -> (bool, u64, u64) {
        if let Some(evicted) = self.recency.touch(&key.to_string()) {
            self.logs.remove(&evicted);
        }

        let entry = self
            .logs
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut log = entry.lock().unwrap();

        let now = Instant::now();
        let window = std::time::Duration::from_secs(self.window_secs);
        while let Some(front) = log.front() {
            if now.duration_since(*front) > window {
                log.pop_front();
            } else {
                break;
            }
        }

        let cost = cost.max(1);
        if (log.len() as u64) + cost <= self.max_requests {
            for _ in 0..cost {
                log.push_back(now);
            }
            (true, self.max_requests - log.len() as u64, 0)
        } else {
            let retry_after = log
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)).as_secs().max(1))
                .unwrap_or(self.window_secs.max(1));
            (false, 0, retry_after)
        }
    }

    /// Non-mutating inspection of `key`'s current availability (spec §4.9):
    /// counts still-live entries and reports what a `consume` would do,
    /// without appending a new arrival or touching LRU recency.
    fn check(&self, key: &str) -> (bool, u64, u64) {
        let now = Instant::now();
        let window = std::time::Duration::from_secs(self.window_secs);

        match self.logs.get(key) {
            Some(entry) => {
                let log = entry.lock().unwrap();
                let live: Vec<&Instant> = log
                    .iter()
                    .filter(|t| now.duration_since(**t) <= window)
                    .collect();
                let count = live.len() as u64;
                if count < self.max_requests {
                    (true, self.max_requests - count, 0)
                } else {
                    let retry_after = live
                        .first()
                        .map(|oldest| window.saturating_sub(now.duration_since(**oldest)).as_secs().max(1))
                        .unwrap_or(self.window_secs.max(1));
                    (false, 0, retry_after)
                }
            }
            None => (true, self.max_requests, 0),
        }
    }
}

impl PluginInstance for SlidingWindowInstance {
    fn name(&self) -> &str {
        "sliding-window-limit"
    }

    fn priority(&self) -> i32 {
        1002
    }

    fn access(&self, ctx: &mut PluginContext) -> PluginResult {
        let key = match self.limit_by.as_str() {
            "route" => ctx.route_id.clone(),
            _ => ctx.client_ip.clone(),
        };

        let (allowed, remaining, retry_after) = self.consume(&key, 1);

        if !allowed {
            return PluginResult::Response {
                status: 429,
                headers: vec![
                    ("content-type".to_string(), "application/json".to_string()),
                    (
                        "x-ratelimit-limit".to_string(),
                        self.max_requests.to_string(),
                    ),
                    ("x-ratelimit-remaining".to_string(), "0".to_string()),
                    ("retry-after".to_string(), retry_after.to_string()),
                ],
                body: Some(
                    format!(r#"{{"error":"{}","status":429}}"#, self.message).into_bytes(),
                ),
            };
        }

        ctx.set_response_header("x-ratelimit-remaining".to_string(), remaining.to_string());
        PluginResult::Continue
    }
}
