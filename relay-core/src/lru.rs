//! Bounded key recency tracker shared by the rate limiters (spec §4.9) and
//! the response cache (spec §4.10), both of which need "at most N_max keys,
//! LRU eviction on insert-over-limit" without wanting to reimplement the
//! bookkeeping twice.
//!
//! The value storage itself (token bucket state, cached response bytes) is
//! owned by the caller, typically in a `DashMap` so that concurrent access to
//! distinct keys doesn't serialize; this structure only tracks *recency
//! order*, which is a small, fast critical section.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

struct Inner<K> {
    /// Exactly one entry per live key, oldest at the front. Re-touching a
    /// key removes its old position before re-appending so `order` never
    /// grows past `present`'s size.
    order: VecDeque<K>,
    present: HashMap<K, ()>,
}

/// Tracks up to `capacity` keys in least-recently-used order.
pub struct LruKeyMap<K> {
    inner: Mutex<Inner<K>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> LruKeyMap<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::with_capacity(capacity.min(1024)),
                present: HashMap::with_capacity(capacity.min(1024)),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Mark `key` as most-recently-used. If it is new and the map is now
    /// over capacity, returns the evicted (least-recently-used) key.
    pub fn touch(&self, key: &K) -> Option<K> {
        let mut inner = self.inner.lock().unwrap();
        if inner.present.contains_key(key) {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
            inner.order.push_back(key.clone());
            return None;
        }
        inner.present.insert(key.clone(), ());
        inner.order.push_back(key.clone());

        if inner.present.len() > self.capacity {
            let evicted = inner.order.pop_front();
            if let Some(ref k) = evicted {
                inner.present.remove(k);
            }
            evicted
        } else {
            None
        }
    }

    /// Remove a key explicitly (e.g. on `reset`).
    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        inner.present.remove(key);
        inner.order.retain(|k| k != key);
    }

    /// Evict and return the current least-recently-used key, regardless of
    /// whether the map is over capacity. Used by callers (e.g. the response
    /// cache) that evict on a byte budget rather than a key-count budget.
    pub fn pop_lru(&self) -> Option<K> {
        let mut inner = self.inner.lock().unwrap();
        let candidate = inner.order.pop_front()?;
        inner.present.remove(&candidate);
        Some(candidate)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
