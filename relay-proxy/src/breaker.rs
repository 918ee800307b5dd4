//! Per-upstream circuit breaker (spec §4.4): CLOSED / OPEN / HALF_OPEN.
//!
//! Grounded on the teacher's `AtomicU64`/`Ordering` idioms already used in
//! `relay-core::router`'s version counter — here applied to per-node state
//! stored in [`relay_core::upstream::NodeRuntimeState`], so the breaker
//! itself is stateless: it's a small set of transition rules operating on
//! shared atomics, callable from any worker thread without a lock.

use relay_core::upstream::{CircuitState, NodeRuntimeState};
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures (in CLOSED) before tripping to OPEN.
    pub failure_threshold: u32,
    /// Consecutive successes (in HALF_OPEN) before closing again.
    pub success_threshold: u32,
    /// How long OPEN lasts before a probe is allowed through.
    pub open_duration_ms: u32,
    /// Max concurrent probe requests allowed while HALF_OPEN.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_ms: 30_000,
            half_open_max_probes: 1,
        }
    }
}

/// The verdict for a request about to be sent to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Allowed as a HALF_OPEN trial probe — caller must report the outcome.
    AllowAsProbe,
    Reject,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config }
    }

    /// Decide whether a request to this node may proceed. `now_ms` is a
    /// monotonic millisecond clock (the worker's own, passed in rather than
    /// read here so tests can drive it deterministically).
    pub fn admit(&self, state: &NodeRuntimeState, now_ms: u32) -> Admission {
        match state.circuit_state() {
            CircuitState::Closed => Admission::Allow,
            CircuitState::Open => {
                let last = state.last_transition_ns.load(Ordering::Acquire);
                if now_ms.saturating_sub(last) >= self.config.open_duration_ms {
                    self.transition(state, CircuitState::HalfOpen, now_ms);
                    self.try_admit_probe(state)
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => self.try_admit_probe(state),
        }
    }

    fn try_admit_probe(&self, state: &NodeRuntimeState) -> Admission {
        let prior = state.half_open_probes_in_flight.fetch_add(1, Ordering::AcqRel);
        if prior < self.config.half_open_max_probes {
            Admission::AllowAsProbe
        } else {
            state.half_open_probes_in_flight.fetch_sub(1, Ordering::AcqRel);
            Admission::Reject
        }
    }

    /// Report the outcome of a request that `admit` allowed through.
    pub fn on_success(&self, state: &NodeRuntimeState, now_ms: u32) {
        match state.circuit_state() {
            CircuitState::Closed => {
                state.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                state.half_open_probes_in_flight.fetch_sub(1, Ordering::AcqRel);
                let successes = state.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition(state, CircuitState::Closed, now_ms);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self, state: &NodeRuntimeState, now_ms: u32) {
        match state.circuit_state() {
            CircuitState::Closed => {
                let failures = state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition(state, CircuitState::Open, now_ms);
                }
            }
            CircuitState::HalfOpen => {
                state.half_open_probes_in_flight.fetch_sub(1, Ordering::AcqRel);
                self.transition(state, CircuitState::Open, now_ms);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, state: &NodeRuntimeState, to: CircuitState, now_ms: u32) {
        state.breaker_state.store(to as u8, Ordering::Release);
        state.last_transition_ns.store(now_ms, Ordering::Release);
        state.consecutive_failures.store(0, Ordering::Release);
        state.consecutive_successes.store(0, Ordering::Release);
        if to != CircuitState::HalfOpen {
            state.half_open_probes_in_flight.store(0, Ordering::Release);
        }
    }
}
