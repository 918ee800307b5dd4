//! Rolling history of periodic metrics snapshots, for `GET /api/metrics/history`.
//!
//! A fixed-capacity ring buffer fed by a background ticker (see
//! `server::spawn_history_sampler`), sampled roughly once per second. Kept
//! deliberately dumb: no persistence, no downsampling — just enough history
//! to answer "what did the last N minutes look like" without reaching for a
//! real time-series store, which is out of scope per spec.md §1.

use relay_observability::metrics::MetricsSummary;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Samples older than this are evicted regardless of capacity, so a slow
/// sampler (or a long-lived process) never serves a misleadingly long window.
const MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize)]
pub struct HistorySample {
    pub timestamp_ms: u64,
    pub summary: MetricsSummary,
}

pub struct MetricsHistory {
    capacity: usize,
    samples: Mutex<VecDeque<HistorySample>>,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, timestamp_ms: u64, summary: MetricsSummary) {
        let mut samples = self.samples.lock();
        samples.push_back(HistorySample { timestamp_ms, summary });
        while samples.len() > self.capacity {
            samples.pop_front();
        }
        let cutoff = timestamp_ms.saturating_sub(MAX_AGE_MS);
        while samples.front().map(|s| s.timestamp_ms < cutoff).unwrap_or(false) {
            samples.pop_front();
        }
    }

    /// Samples within the last `window_minutes` minutes, oldest first.
    pub fn window(&self, now_ms: u64, window_minutes: u64) -> Vec<HistorySample> {
        let window_ms = window_minutes.saturating_mul(60_000);
        let cutoff = now_ms.saturating_sub(window_ms);
        self.samples
            .lock()
            .iter()
            .filter(|s| s.timestamp_ms >= cutoff)
            .cloned()
            .collect()
    }
}
