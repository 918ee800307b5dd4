//! Retry policy (spec §4.7): exponential backoff with jitter, a shared
//! retry budget, and an idempotent-method gate.
//!
//! Grounded on the teacher's `health_check.rs`, which already pulls in
//! `tokio::time` for its probe interval loop — the backoff delay here uses
//! the same `Duration` vocabulary. The jitter source (`rand`) is new,
//! justified the same way as `balancer.rs`'s random pick.

use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt (`backoff_multiplier^0 * initial_delay_ms`).
    pub initial_delay_ms: u64,
    /// Ceiling the computed delay is clamped to, regardless of attempt count.
    pub max_delay_ms: u64,
    /// Multiplier applied per additional attempt: `delay = min(initialDelay
    /// * backoffMultiplier^(attempt-1), maxDelay)` (spec §4.7 rule 1).
    pub backoff_multiplier: f64,
    /// When true, the computed delay is sampled uniformly from `[0, delay]`
    /// instead of used as-is (spec §4.7 rule 1: "if jitter, sample
    /// uniformly in [0, delay]").
    pub jitter: bool,
    /// Retry budget expressed as additional retries allowed per 100
    /// successful (non-retried) requests, à la Envoy/Finagle retry
    /// budgets — bounds retry amplification under a sustained upstream
    /// failure instead of letting every failed request multiply traffic.
    pub budget_per_hundred: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter: true,
            budget_per_hundred: 20,
        }
    }
}

/// Only idempotent methods are safe to retry without the caller's consent
/// (spec §4.7) — a POST that already reached the upstream must not be
/// replayed blindly.
pub fn is_idempotent(method: &str) -> bool {
    matches!(
        method.to_ascii_uppercase().as_str(),
        "GET" | "HEAD" | "OPTIONS" | "PUT" | "DELETE"
    )
}

/// Deterministic backoff delay for the attempt that just failed (1-indexed):
/// `delay = min(initialDelay * backoffMultiplier^(attempt-1), maxDelay)`
/// (spec §4.7 rule 1). Jitter — sampling uniformly in `[0, delay]` — is
/// applied only when `config.jitter` is set; otherwise the delay is used
/// exactly as computed, which is what makes Scenario 5's "delays ≈ 10ms and
/// 20ms" reproducible.
pub fn backoff_with_jitter(attempt: u32, config: &RetryConfig) -> Duration {
    let exp = config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    let delay_ms = (config.initial_delay_ms as f64 * exp) as u64;
    let delay_ms = delay_ms.min(config.max_delay_ms);
    if !config.jitter || delay_ms == 0 {
        return Duration::from_millis(delay_ms);
    }
    let jittered = rand::thread_rng().gen_range(0..=delay_ms);
    Duration::from_millis(jittered)
}

/// Remaining time in the shared retry budget for this request (spec §4.7
/// rule 2 / §5's per-request deadline shared across retries), or `None`
/// once it has been exhausted.
pub fn remaining_budget(req_start: Instant, timeout_ms: u64) -> Option<Duration> {
    let timeout = Duration::from_millis(timeout_ms);
    let elapsed = req_start.elapsed();
    if elapsed >= timeout {
        None
    } else {
        Some(timeout - elapsed)
    }
}

/// Shared retry budget: a token bucket where deposits come from requests
/// that succeeded on the first attempt, and every retry attempt withdraws
/// one token. When the bucket is empty, retries are refused even for
/// idempotent methods — this is what keeps a struggling upstream from
/// being hit with `max_attempts`x the offered load.
pub struct RetryBudget {
    /// Scaled by 100 so `budget_per_hundred` deposits can be fractional
    /// per request without floating point.
    tokens_x100: AtomicI64,
    deposit_per_request_x100: i64,
    max_tokens_x100: i64,
}

impl RetryBudget {
    pub fn new(config: &RetryConfig, min_tokens: u32) -> Self {
        let deposit = config.budget_per_hundred as i64;
        Self {
            tokens_x100: AtomicI64::new((min_tokens as i64) * 100),
            deposit_per_request_x100: deposit,
            max_tokens_x100: (min_tokens.max(10) as i64) * 100,
        }
    }

    /// Call once per request that completed without needing a retry.
    pub fn deposit(&self) {
        let mut cur = self.tokens_x100.load(Ordering::Relaxed);
        loop {
            let next = (cur + self.deposit_per_request_x100).min(self.max_tokens_x100);
            match self.tokens_x100.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Attempt to withdraw one retry's worth of budget (100 units).
    /// Returns `false` if the budget is exhausted.
    pub fn try_withdraw(&self) -> bool {
        let mut cur = self.tokens_x100.load(Ordering::Relaxed);
        loop {
            if cur < 100 {
                return false;
            }
            match self.tokens_x100.compare_exchange_weak(
                cur,
                cur - 100,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

pub struct RetryManager {
    config: RetryConfig,
    budget: RetryBudget,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        let budget = RetryBudget::new(&config, 10);
        Self { config, budget }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Decide whether attempt number `attempt` (1-indexed, the attempt that
    /// just failed) should be followed by another try.
    pub fn should_retry(&self, method: &str, attempt: u32, retryable_error: bool) -> bool {
        if !retryable_error || !is_idempotent(method) {
            return false;
        }
        if attempt >= self.config.max_attempts {
            return false;
        }
        self.budget.try_withdraw()
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_with_jitter(attempt, &self.config)
    }

    pub fn record_clean_success(&self) {
        self.budget.deposit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_methods_are_identified_correctly() {
        assert!(is_idempotent("GET"));
        assert!(is_idempotent("get"));
        assert!(is_idempotent("DELETE"));
        assert!(!is_idempotent("POST"));
        assert!(!is_idempotent("PATCH"));
    }

    #[test]
    fn non_idempotent_method_never_retries() {
        let mgr = RetryManager::new(RetryConfig::default());
        assert!(!mgr.should_retry("POST", 1, true));
    }

    #[test]
    fn non_retryable_error_never_retries() {
        let mgr = RetryManager::new(RetryConfig::default());
        assert!(!mgr.should_retry("GET", 1, false));
    }

    #[test]
    fn stops_after_max_attempts() {
        let mgr = RetryManager::new(RetryConfig {
            max_attempts: 2,
            ..Default::default()
        });
        assert!(mgr.should_retry("GET", 1, true));
        assert!(!mgr.should_retry("GET", 2, true));
    }

    #[test]
    fn budget_exhaustion_stops_retries_even_for_idempotent_methods() {
        let mgr = RetryManager::new(RetryConfig {
            max_attempts: 100,
            budget_per_hundred: 0,
            ..Default::default()
        });
        // Starting budget is 10 tokens worth (1000/100 = 10 withdrawals).
        let mut allowed = 0;
        for _ in 0..50 {
            if mgr.should_retry("GET", 1, true) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn deposits_replenish_the_budget() {
        let budget = RetryBudget::new(
            &RetryConfig {
                budget_per_hundred: 50,
                ..Default::default()
            },
            1,
        );
        for _ in 0..100 {
            budget.try_withdraw();
        }
        assert!(!budget.try_withdraw());
        budget.deposit();
        budget.deposit();
        assert!(budget.try_withdraw());
    }

    #[test]
    fn backoff_never_exceeds_configured_max() {
        let config = RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 500,
            ..Default::default()
        };
        for attempt in 0..10 {
            let d = backoff_with_jitter(attempt, &config);
            assert!(d.as_millis() <= 500);
        }
    }

    #[test]
    fn deterministic_backoff_without_jitter_matches_scenario_5() {
        // maxAttempts=3, initialDelay=10ms, backoff=2, jitter=false: the
        // delay before attempt 2 is 10ms, before attempt 3 is 20ms.
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter: false,
            budget_per_hundred: 100,
        };
        assert_eq!(backoff_with_jitter(1, &config), Duration::from_millis(10));
        assert_eq!(backoff_with_jitter(2, &config), Duration::from_millis(20));
    }

    #[test]
    fn jittered_backoff_stays_within_zero_to_delay() {
        let config = RetryConfig {
            initial_delay_ms: 10,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter: true,
            ..Default::default()
        };
        for _ in 0..20 {
            let d = backoff_with_jitter(2, &config);
            assert!(d.as_millis() <= 20);
        }
    }

    #[test]
    fn remaining_budget_is_none_once_timeout_elapsed() {
        let start = Instant::now() - Duration::from_millis(50);
        assert!(remaining_budget(start, 10).is_none());
    }

    #[test]
    fn remaining_budget_shrinks_toward_timeout() {
        let start = Instant::now();
        let remaining = remaining_budget(start, 1_000).unwrap();
        assert!(remaining <= Duration::from_millis(1_000));
    }
}
