//! Per-request scratch state, pooled per worker thread (spec §4.1, §9).
//!
//! Grounded on [`relay_plugin::plugin::PluginContext`]'s field shape (method,
//! path, headers, route params, consumer, timings) but reworked into a
//! genuinely poolable value type: no trait objects, no `Rc`/`Arc` graphs
//! inside the struct itself, and a `reset()` that zeroes it for reuse
//! instead of allocating a fresh one per request. Each `monoio` worker owns
//! exactly one [`ContextPool`] (hence `Rc`, not `Arc` — it never crosses a
//! thread boundary), so `acquire`/`release` never take a lock and never
//! block.

use std::cell::RefCell;
use std::rc::Rc;

/// The fixed set of instants recorded as a request moves through the
/// pipeline. All are nanoseconds since the context's `start_ns` baseline,
/// so they fit in a `u32` in practice but we keep `u64` for headroom.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timestamps {
    pub route_matched_ns: Option<u64>,
    pub plugin_start_ns: Option<u64>,
    pub plugin_end_ns: Option<u64>,
    pub upstream_start_ns: Option<u64>,
    pub upstream_end_ns: Option<u64>,
}

impl Timestamps {
    fn reset(&mut self) {
        *self = Timestamps::default();
    }
}

/// Poolable per-request scratch state. Lives for exactly one request's
/// lifetime on one worker thread, then is reset and returned to its pool.
#[derive(Debug)]
pub struct RequestContext {
    /// Monotonically increasing per-worker sequence number, reassigned on
    /// every acquire. Not globally unique by itself; combined with a
    /// worker id upstream it forms the request id used in logs/traces.
    pub request_id: u64,
    pub start_ns: u64,

    pub method: String,
    /// Path only, query string stripped (mirrors the teacher's
    /// `PluginContext::new` split-on-`?` behavior).
    pub path: String,
    pub query_raw: String,

    /// Route parameters captured by the router (`:id`, wildcard tail, ...).
    /// Reused across requests — cleared, not reallocated, on reset.
    pub route_params: Vec<(String, String)>,

    pub client_ip: String,
    pub upstream_addr: Option<String>,
    pub route_id: Option<String>,

    pub responded: bool,
    pub timestamps: Timestamps,
}

impl RequestContext {
    fn new() -> Self {
        Self {
            request_id: 0,
            start_ns: 0,
            method: String::new(),
            path: String::new(),
            query_raw: String::new(),
            route_params: Vec::new(),
            client_ip: String::new(),
            upstream_addr: None,
            route_id: None,
            responded: false,
            timestamps: Timestamps::default(),
        }
    }

    /// Zero the context for reuse, retaining the `String`/`Vec` backing
    /// allocations so a request that already warmed them up doesn't pay for
    /// a fresh allocation on the next one.
    fn reset(&mut self) {
        self.request_id = 0;
        self.start_ns = 0;
        self.method.clear();
        self.path.clear();
        self.query_raw.clear();
        self.route_params.clear();
        self.client_ip.clear();
        self.upstream_addr = None;
        self.route_id = None;
        self.responded = false;
        self.timestamps.reset();
    }

    pub fn elapsed_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.start_ns)
    }
}

/// Snapshot of pool behavior, exposed to `relay-observability`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub allocations: u64,
    pub in_use: u64,
}

struct Inner {
    free: Vec<RequestContext>,
    capacity: usize,
    total_created: usize,
    next_id: u64,
    stats: PoolStats,
}

/// Thread-local slab of [`RequestContext`] values. `acquire` never blocks:
/// if the free list is empty it allocates, and only counts the allocation
/// as a "miss" once the pool has grown past its nominal `capacity` (the
/// ceiling is advisory, not a hard cap — a burst of concurrent in-flight
/// requests must never stall on context allocation).
#[derive(Clone)]
pub struct ContextPool {
    inner: Rc<RefCell<Inner>>,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(RequestContext::new());
        }
        Self {
            inner: Rc::new(RefCell::new(Inner {
                free,
                capacity,
                total_created: capacity,
                next_id: 0,
                stats: PoolStats::default(),
            })),
        }
    }

    pub fn acquire(&self, start_ns: u64) -> PooledContext {
        let mut inner = self.inner.borrow_mut();
        let mut ctx = match inner.free.pop() {
            Some(ctx) => {
                inner.stats.hits += 1;
                ctx
            }
            None => {
                let ctx = RequestContext::new();
                inner.total_created += 1;
                inner.stats.allocations += 1;
                if inner.total_created > inner.capacity {
                    inner.stats.misses += 1;
                }
                ctx
            }
        };
        inner.next_id = inner.next_id.wrapping_add(1);
        ctx.request_id = inner.next_id;
        ctx.start_ns = start_ns;
        inner.stats.in_use += 1;

        PooledContext {
            ctx: Some(ctx),
            pool: self.inner.clone(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.borrow().stats
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity
    }
}

/// An acquired context. Returns itself to the owning pool on drop.
pub struct PooledContext {
    ctx: Option<RequestContext>,
    pool: Rc<RefCell<Inner>>,
}

impl std::ops::Deref for PooledContext {
    type Target = RequestContext;
    fn deref(&self) -> &RequestContext {
        self.ctx.as_ref().expect("context taken before drop")
    }
}

impl std::ops::DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut RequestContext {
        self.ctx.as_mut().expect("context taken before drop")
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            ctx.reset();
            let mut inner = self.pool.borrow_mut();
            inner.stats.in_use = inner.stats.in_use.saturating_sub(1);
            if inner.free.len() < inner.capacity {
                inner.free.push(ctx);
            } else {
                inner.total_created = inner.total_created.saturating_sub(1);
            }
        }
    }
}
