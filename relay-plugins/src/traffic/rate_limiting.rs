use relay_plugin::plugin::{Phase, Plugin, PluginContext, PluginInstance, PluginResult};
use relay_core::lru::LruKeyMap;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Instant;

/// Token-bucket rate limiter, keyed by client IP or route.
///
/// Unlike `limit-count`'s fixed window, tokens refill continuously — a
/// bucket that's been idle for half the window has half its capacity back,
/// rather than waiting for a hard window boundary to reset. The key space
/// is bounded via `relay_core::lru::LruKeyMap` so an attacker cycling
/// source IPs can't grow this unboundedly; the least-recently-seen bucket
/// is evicted (and simply starts full again on next use) once the cap is
/// hit.
pub struct RateLimitingPlugin;

#[derive(Debug, Deserialize, Clone)]
struct RateLimitingConfig {
    /// Requests per second.
    #[serde(default)]
    rate: Option<u64>,
    /// Requests per minute.
    #[serde(default)]
    rate_per_minute: Option<u64>,
    /// Requests per hour.
    #[serde(default)]
    rate_per_hour: Option<u64>,
    /// Burst capacity on top of the steady rate; defaults to the
    /// steady-state rate itself (one window's worth of burst).
    #[serde(default)]
    burst: Option<u64>,
    /// Limit by: "ip" (default) or "route".
    #[serde(default = "default_limit_by")]
    limit_by: String,
    /// Custom rejection message.
    #[serde(default = "default_message")]
    message: String,
    /// Max distinct keys tracked before LRU eviction kicks in.
    #[serde(default = "default_max_keys")]
    max_keys: usize,
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

/// A single bucket's state: fractional tokens scaled by 1000 so refill
/// math (tokens_per_sec * elapsed_secs, itself fractional) stays in
/// integer arithmetic without losing precision across frequent ticks.
struct Bucket {
    tokens_milli: i64,
    last_refill: Instant,
}

struct RateLimitingInstance {
    capacity: u64,
    /// Tokens added per second.
    refill_per_sec: f64,
    limit_by: String,
    message: String,
    buckets: DashMap<String, Mutex<Bucket>>,
    recency: LruKeyMap<String>,
}

impl Plugin for RateLimitingPlugin {
    fn name(&self) -> &str {
        "rate-limiting"
    }

    fn priority(&self) -> i32 {
        1001 // APISIX default priority for limit-req
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let cfg: RateLimitingConfig = serde_json::from_value(config.clone())?;

        // Resolve rate configuration (priority: rate > rate_per_minute > rate_per_hour)
        let (rate, window_secs) = if let Some(rps) = cfg.rate {
            (rps, 1u64)
        } else if let Some(rpm) = cfg.rate_per_minute {
            (rpm, 60)
        } else if let Some(rph) = cfg.rate_per_hour {
            (rph, 3600)
        } else {
            // Default: 60 requests per minute
            (60, 60)
        };

        let refill_per_sec = rate as f64 / window_secs as f64;
        let capacity = cfg.burst.unwrap_or(rate).max(1);

        Ok(Box::new(RateLimitingInstance {
            capacity,
            refill_per_sec,
            limit_by: cfg.limit_by,
            message: cfg.message,
            buckets: DashMap::new(),
            recency: LruKeyMap::new(cfg.max_keys),
        }))
    }
}

impl RateLimitingInstance {
    /// Withdraw `cost` tokens from `key`'s bucket, creating it full (minus
    /// this request) if new. Returns `(allowed, tokens_remaining,
    /// retry_after_secs)`; `retry_after_secs` is only meaningful when denied
    /// and is `(cost - current) / rate` per spec, rounded up.
    fn consume(&self, key: &str, cost: u64) -> (bool, u64, u64) {
        if let Some(evicted) = self.recency.touch(&key.to_string()) {
            self.buckets.remove(&evicted);
        }

        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Bucket {
                tokens_milli: self.capacity as i64 * 1000,
                last_refill: Instant::now(),
            }));

        let mut bucket = entry.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;

        let refill_milli = (elapsed * self.refill_per_sec * 1000.0) as i64;
        let cap_milli = self.capacity as i64 * 1000;
        bucket.tokens_milli = (bucket.tokens_milli + refill_milli).min(cap_milli);

        let cost_milli = (cost as i64).max(1) * 1000;
        if bucket.tokens_milli >= cost_milli {
            bucket.tokens_milli -= cost_milli;
            (true, (bucket.tokens_milli / 1000) as u64, 0)
        } else {
            let missing = (cost_milli - bucket.tokens_milli).max(0) as f64 / 1000.0;
            let retry_after = (missing / self.refill_per_sec).ceil().max(1.0) as u64;
            (false, 0, retry_after)
        }
    }

    /// Non-mutating inspection of `key`'s current availability (spec §4.9:
    /// both limiters expose `consume` and a non-mutating `check`). Reports
    /// what the bucket would look like after accounting for elapsed refill,
    /// without withdrawing any tokens or touching LRU recency.
    fn check(&self, key: &str) -> (bool, u64, u64) {
        let tokens_milli = match self.buckets.get(key) {
            Some(entry) => {
                let bucket = entry.lock().unwrap();
                let elapsed = Instant::now().duration_since(bucket.last_refill).as_secs_f64();
                let refill_milli = (elapsed * self.refill_per_sec * 1000.0) as i64;
                (bucket.tokens_milli + refill_milli).min(self.capacity as i64 * 1000)
            }
            None => self.capacity as i64 * 1000,
        };

        if tokens_milli >= 1000 {
            (true, (tokens_milli / 1000) as u64, 0)
        } else {
            let missing = (1000 - tokens_milli).max(0) as f64 / 1000.0;
            let retry_after = (missing / self.refill_per_sec).ceil().max(1.0) as u64;
            (false, 0, retry_after)
        }
    }
}

impl PluginInstance for RateLimitingInstance {
    fn name(&self) -> &str {
        "rate-limiting"
    }

    fn priority(&self) -> i32 {
        1001
    }

    fn access(&self, ctx: &mut PluginContext) -> PluginResult {
        let key = match self.limit_by.as_str() {
            "route" => ctx.route_id.clone(),
            _ => ctx.client_ip.clone(), // default: per-IP
        };

        let (allowed, remaining, retry_after) = self.consume(&key, 1);

        if !allowed {
            return PluginResult::Response {
                status: 429,
                headers: vec![
                    ("content-type".to_string(), "application/json".to_string()),
                    ("x-ratelimit-limit".to_string(), self.capacity.to_string()),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread::sleep;
    use std::time::Duration;

    fn make_ctx(ip: &str) -> PluginContext {
        PluginContext::new(
            "GET".into(),
            "/api".into(),
            HashMap::new(),
            ip.into(),
            "r1".into(),
        )
    }

    #[test]
    fn allows_requests_within_capacity() {
        let boxed = RateLimitingPlugin
            .configure(&serde_json::json!({ "rate": 5 }))
            .unwrap();
        for _ in 0..5 {
            let mut ctx = make_ctx("1.2.3.4");
            assert!(matches!(boxed.access(&mut ctx), PluginResult::Continue));
        }
    }

    #[test]
    fn rejects_once_capacity_exhausted() {
        let boxed = RateLimitingPlugin
            .configure(&serde_json::json!({ "rate": 2, "burst": 2 }))
            .unwrap();
        for _ in 0..2 {
            let mut ctx = make_ctx("1.2.3.4");
            assert!(matches!(boxed.access(&mut ctx), PluginResult::Continue));
        }
        let mut ctx = make_ctx("1.2.3.4");
        assert!(matches!(
            boxed.access(&mut ctx),
            PluginResult::Response { status: 429, .. }
        ));
    }

    #[test]
    fn retry_after_reflects_remaining_fill_time_not_a_full_period() {
        let boxed = RateLimitingPlugin
            .configure(&serde_json::json!({ "rate": 2, "burst": 1 }))
            .unwrap();
        let mut ctx = make_ctx("5.5.5.5");
        assert!(matches!(boxed.access(&mut ctx), PluginResult::Continue));
        let mut ctx2 = make_ctx("5.5.5.5");
        match boxed.access(&mut ctx2) {
            PluginResult::Response { headers, .. } => {
                let retry_after: u64 = headers
                    .iter()
                    .find(|(k, _)| k == "retry-after")
                    .unwrap()
                    .1
                    .parse()
                    .unwrap();
                // at 2 tokens/sec a full token takes 500ms; ceil'd to 1s, not
                // a whole window.
                assert_eq!(retry_after, 1);
            }
            other => panic!("expected 429, got {other:?}"),
        }
    }

    #[test]
    fn distinct_keys_have_independent_buckets() {
        let boxed = RateLimitingPlugin
            .configure(&serde_json::json!({ "rate": 1, "burst": 1 }))
            .unwrap();
        let mut ctx_a = make_ctx("1.1.1.1");
        let mut ctx_b = make_ctx("2.2.2.2");
        assert!(matches!(boxed.access(&mut ctx_a), PluginResult::Continue));
        assert!(matches!(boxed.access(&mut ctx_b), PluginResult::Continue));
    }

    #[test]
    fn tokens_refill_over_time() {
        let boxed = RateLimitingPlugin
            .configure(&serde_json::json!({ "rate": 100, "burst": 1 }))
            .unwrap();
        let mut ctx = make_ctx("9.9.9.9");
        assert!(matches!(boxed.access(&mut ctx), PluginResult::Continue));
        // Exhausted; immediate retry should fail.
        let mut ctx2 = make_ctx("9.9.9.9");
        assert!(matches!(
            boxed.access(&mut ctx2),
            PluginResult::Response { status: 429, .. }
        ));
        // At 100 tokens/sec, ~20ms refills ~2 tokens worth.
        sleep(Duration::from_millis(30));
        let mut ctx3 = make_ctx("9.9.9.9");
        assert!(matches!(boxed.access(&mut ctx3), PluginResult::Continue));
    }

    #[test]
    fn check_does_not_withdraw_tokens() {
        let instance = RateLimitingInstance {
            capacity: 2,
            refill_per_sec: 2.0,
            limit_by: "ip".to_string(),
            message: "Rate limit exceeded".to_string(),
            buckets: DashMap::new(),
            recency: LruKeyMap::new(100_000),
        };

        // Peeking a never-seen key reports the full, untouched capacity.
        assert_eq!(instance.check("9.9.9.9"), (true, 2, 0));

        // One real withdrawal via `consume`...
        assert!(instance.consume("9.9.9.9", 1).0);
        let after_consume = instance.check("9.9.9.9");
        assert!(after_consume.0);

        // ...and repeated `check` calls must not themselves drain tokens.
        assert_eq!(instance.check("9.9.9.9"), after_consume);
        assert_eq!(instance.check("9.9.9.9"), after_consume);
    }

    #[test]
    fn consume_accepts_a_variable_cost() {
        let instance = RateLimitingInstance {
            capacity: 5,
            refill_per_sec: 5.0,
            limit_by: "ip".to_string(),
            message: "Rate limit exceeded".to_string(),
            buckets: DashMap::new(),
            recency: LruKeyMap::new(100_000),
        };

        // A cost-3 request against a fresh 5-token bucket succeeds, leaving 2.
        let (allowed, remaining, _) = instance.consume("1.1.1.1", 3);
        assert!(allowed);
        assert_eq!(remaining, 2);

        // A further cost-3 request exceeds the remaining 2 tokens and is denied.
        let (allowed, _, retry_after) = instance.consume("1.1.1.1", 3);
        assert!(!allowed);
        assert!(retry_after >= 1);
    }

    #[test]
    fn limit_by_route_shares_bucket_across_ips() {
        let boxed = RateLimitingPlugin
            .configure(&serde_json::json!({ "rate": 1, "burst": 1, "limit_by": "route" }))
            .unwrap();
        let mut ctx_a = make_ctx("1.1.1.1");
        let mut ctx_b = make_ctx("2.2.2.2");
        assert!(matches!(boxed.access(&mut ctx_a), PluginResult::Continue));
        assert!(matches!(
            boxed.access(&mut ctx_b),
            PluginResult::Response { status: 429, .. }
        ));
    }
}
