use relay_core::consumer::Consumer;
use relay_core::lru::LruKeyMap;
use relay_core::plugin_config::PluginConfig;
use relay_core::route::Route;
use relay_core::service::Service;
use relay_core::ssl::SslCert;
use relay_core::upstream::Upstream;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// In-memory configuration cache for zero-latency lookups.
///
/// The cache is populated from etcd on startup and kept in sync
/// via the ConfigWatcher. All proxy decisions read from this cache
/// rather than hitting etcd on every request.
#[derive(Clone)]
pub struct ConfigCache {
    pub routes: Arc<DashMap<String, Route>>,
    pub services: Arc<DashMap<String, Service>>,
    pub upstreams: Arc<DashMap<String, Upstream>>,
    pub consumers: Arc<DashMap<String, Consumer>>,
    pub ssl_certs: Arc<DashMap<String, SslCert>>,
    pub plugin_configs: Arc<DashMap<String, PluginConfig>>,
    /// key-auth credential → username, rebuilt whenever consumers change.
    pub consumer_key_index: Arc<DashMap<String, String>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            services: Arc::new(DashMap::new()),
            upstreams: Arc::new(DashMap::new()),
            consumers: Arc::new(DashMap::new()),
            ssl_certs: Arc::new(DashMap::new()),
            plugin_configs: Arc::new(DashMap::new()),
            consumer_key_index: Arc::new(DashMap::new()),
        }
    }

    /// Snapshot of every route currently in the cache.
    pub fn all_routes(&self) -> Vec<Route> {
        self.routes.iter().map(|e| e.value().clone()).collect()
    }

    /// Rebuild the key-auth `key → username` index from the current consumer
    /// set. Called after any consumer insert/delete so `find_consumer_by_key`
    /// stays in sync without scanning consumers on every request.
    pub fn rebuild_consumer_key_index(&self) {
        self.consumer_key_index.clear();
        for entry in self.consumers.iter() {
            let username = entry.key().clone();
            let consumer = entry.value();
            if let Some(key) = consumer
                .plugins
                .get("key-auth")
                .and_then(|cfg| cfg.get("key"))
                .and_then(|v| v.as_str())
            {
                self.consumer_key_index.insert(key.to_string(), username);
            }
        }
    }

    /// Look up the consumer username owning a given key-auth credential.
    pub fn find_consumer_by_key(&self, key: &str) -> Option<String> {
        self.consumer_key_index.get(key).map(|e| e.value().clone())
    }

    /// Apply a change event from etcd.
    pub fn apply_change(&self, resource_type: &str, id: &str, value: Option<&str>) {
        match resource_type {
            "routes" => {
                if let Some(val) = value {
                    match serde_json::from_str::<Route>(val) {
                        Ok(route) => {
                            self.routes.insert(id.to_string(), route);
                            debug!(resource = "route", id = id, "Cache updated");
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to deserialize route"),
                    }
                } else {
                    self.routes.remove(id);
                    debug!(resource = "route", id = id, "Cache removed");
                }
            }
            "services" => {
                if let Some(val) = value {
                    if let Ok(service) = serde_json::from_str::<Service>(val) {
                        self.services.insert(id.to_string(), service);
                    }
                } else {
                    self.services.remove(id);
                }
            }
            "upstreams" => {
                if let Some(val) = value {
                    if let Ok(upstream) = serde_json::from_str::<Upstream>(val) {
                        self.upstreams.insert(id.to_string(), upstream);
                    }
                } else {
                    self.upstreams.remove(id);
                }
            }
            "consumers" => {
                if let Some(val) = value {
                    if let Ok(consumer) = serde_json::from_str::<Consumer>(val) {
                        self.consumers.insert(id.to_string(), consumer);
                    }
                } else {
                    self.consumers.remove(id);
                }
                self.rebuild_consumer_key_index();
            }
            "ssl" => {
                if let Some(val) = value {
                    if let Ok(cert) = serde_json::from_str::<SslCert>(val) {
                        self.ssl_certs.insert(id.to_string(), cert);
                    }
                } else {
                    self.ssl_certs.remove(id);
                }
            }
            "plugin_configs" => {
                if let Some(val) = value {
                    if let Ok(config) = serde_json::from_str::<PluginConfig>(val) {
                        self.plugin_configs.insert(id.to_string(), config);
                    }
                } else {
                    self.plugin_configs.remove(id);
                }
            }
            _ => {
                tracing::warn!(resource_type = resource_type, "Unknown resource type in cache");
            }
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            routes: self.routes.len(),
            services: self.services.len(),
            upstreams: self.upstreams.len(),
            consumers: self.consumers.len(),
            ssl_certs: self.ssl_certs.len(),
            plugin_configs: self.plugin_configs.len(),
        }
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct CacheStats {
    pub routes: usize,
    pub services: usize,
    pub upstreams: usize,
    pub consumers: usize,
    pub ssl_certs: usize,
    pub plugin_configs: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "routes={}, services={}, upstreams={}, consumers={}, ssl={}, plugin_configs={}",
            self.routes, self.services, self.upstreams, self.consumers, self.ssl_certs, self.plugin_configs
        )
    }
}

// ── Response cache (spec §4.10) ───────────────────────────────────

/// A cached HTTP response, keyed by `generate_key`.
///
/// Grounded on this file's own `ConfigCache` (a `DashMap` of entries with a
/// bounded, LRU-evicted key set) generalized from config resources to
/// response bytes, plus the Cache-Control/ETag/conditional-request fields
/// spec §4.10 requires.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Monotonic milliseconds at insertion time.
    pub cached_at_ms: u64,
    pub ttl_secs: u64,
    pub stale_while_revalidate_secs: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub size: usize,
}

impl CachedResponse {
    pub fn new(
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        cached_at_ms: u64,
        ttl_secs: u64,
        stale_while_revalidate_secs: Option<u64>,
    ) -> Self {
        let etag = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("etag"))
            .map(|(_, v)| v.clone());
        let last_modified = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("last-modified"))
            .map(|(_, v)| v.clone());
        let size = body.len();
        Self {
            status,
            headers,
            body,
            cached_at_ms,
            ttl_secs,
            stale_while_revalidate_secs,
            etag,
            last_modified,
            size,
        }
    }

    /// Whether a response with this entry's age is still fresh (within ttl)
    /// or within the stale-while-revalidate tolerance window.
    fn is_servable(&self, age_ms: u64) -> bool {
        let ttl_ms = self.ttl_secs.saturating_mul(1000);
        if age_ms <= ttl_ms {
            return true;
        }
        match self.stale_while_revalidate_secs {
            Some(swr) => age_ms <= ttl_ms.saturating_add(swr.saturating_mul(1000)),
            None => false,
        }
    }
}

/// LRU- and size-bounded cache of HTTP responses.
///
/// Grounded on `ConfigCache`'s `DashMap` idiom for concurrent key access;
/// eviction order is tracked by [`relay_core::lru::LruKeyMap`] the same way
/// the rate limiters (`relay-plugins::traffic`) track theirs. Admission is
/// reject-outright for over-size entries rather than admit-then-evict, per
/// spec §3/§4.10.
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
    recency: LruKeyMap<String>,
    max_entries: usize,
    max_bytes: u64,
    current_bytes: AtomicU64,
}

impl ResponseCache {
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            recency: LruKeyMap::new(max_entries.max(1)),
            max_entries: max_entries.max(1),
            max_bytes,
            current_bytes: AtomicU64::new(0),
        }
    }

    /// Stable cache key: method ⊕ path ⊕ ordered (vary-header-name, value)
    /// pairs, hashed with blake3 (chosen — see DESIGN.md — for speed over
    /// `sha2`, which stays reserved for JWT elsewhere).
    pub fn generate_key(method: &str, path: &str, vary_pairs: &[(&str, &str)]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(method.as_bytes());
        hasher.update(b"\0");
        hasher.update(path.as_bytes());
        for (name, value) in vary_pairs {
            hasher.update(b"\0");
            hasher.update(name.to_ascii_lowercase().as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Strong ETag for a body: a quoted blake3 hex digest.
    pub fn generate_etag(body: &[u8]) -> String {
        format!("\"{}\"", blake3::hash(body).to_hex())
    }

    /// Fetch an entry iff it is present and still fresh or within its
    /// stale-while-revalidate window (spec §4.10). `now_ms` is a monotonic
    /// millisecond clock supplied by the caller for testability.
    pub fn get(&self, key: &str, now_ms: u64) -> Option<CachedResponse> {
        let entry = self.entries.get(key)?;
        let age_ms = now_ms.saturating_sub(entry.cached_at_ms);
        if entry.is_servable(age_ms) {
            self.recency.touch(&key.to_string());
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Age of a cached entry in milliseconds, for the `Age` response header.
    pub fn age_ms(&self, key: &str, now_ms: u64) -> Option<u64> {
        self.entries
            .get(key)
            .map(|e| now_ms.saturating_sub(e.cached_at_ms))
    }

    /// Admit an entry. Rejects outright (spec §3: "entries exceeding
    /// max-bytes are rejected, not admitted-then-evicted") if it alone would
    /// exceed `max_bytes`; otherwise evicts LRU entries until there's room.
    pub fn set(&self, key: String, entry: CachedResponse) -> bool {
        let size = entry.size as u64;
        if size > self.max_bytes {
            return false;
        }

        // Replacing an existing entry first frees its own bytes.
        if let Some(old) = self.entries.get(&key) {
            self.current_bytes.fetch_sub(old.size as u64, Ordering::AcqRel);
        } else if self.entries.len() >= self.max_entries {
            // Over the entry-count cap — evict until there's room.
            self.evict_one();
        }

        while self.current_bytes.load(Ordering::Acquire).saturating_add(size) > self.max_bytes {
            if !self.evict_one() {
                // Nothing left to evict but still over budget — reject.
                return false;
            }
        }

        self.current_bytes.fetch_add(size, Ordering::AcqRel);
        self.recency.touch(&key);
        self.entries.insert(key, entry);
        true
    }

    /// Evict the single least-recently-used entry. Returns false if the
    /// cache is empty.
    fn evict_one(&self) -> bool {
        let Some(victim) = self.recency.pop_lru() else {
            return false;
        };
        if let Some((_, removed)) = self.entries.remove(&victim) {
            self.current_bytes.fetch_sub(removed.size as u64, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Some((_, removed)) = self.entries.remove(key) {
            self.current_bytes.fetch_sub(removed.size as u64, Ordering::AcqRel);
            self.recency.remove(&key.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Acquire)
    }
}

/// Cacheability predicate (spec §4.10): only safe, cacheable response
/// shapes, and only when `Cache-Control` doesn't explicitly forbid it.
pub fn is_cacheable(method: &str, status: u16, cache_control: Option<&str>) -> bool {
    if !matches!(method.to_ascii_uppercase().as_str(), "GET" | "HEAD") {
        return false;
    }
    if status != 200 {
        return false;
    }
    if let Some(cc) = cache_control {
        let lower = cc.to_ascii_lowercase();
        if lower.contains("no-store") || lower.contains("no-cache") || lower.contains("private") {
            return false;
        }
    }
    true
}

/// TTL derivation from `Cache-Control`: `s-maxage` > `max-age` > `default_ttl`.
pub fn derive_ttl(cache_control: Option<&str>, default_ttl_secs: u64) -> u64 {
    let Some(cc) = cache_control else {
        return default_ttl_secs;
    };
    let mut s_maxage = None;
    let mut max_age = None;
    for directive in cc.split(',') {
        let directive = directive.trim();
        if let Some(v) = directive.strip_prefix("s-maxage=") {
            s_maxage = v.trim().parse::<u64>().ok();
        } else if let Some(v) = directive.strip_prefix("max-age=") {
            max_age = v.trim().parse::<u64>().ok();
        }
    }
    s_maxage.or(max_age).unwrap_or(default_ttl_secs)
}

/// Stale-while-revalidate window from `Cache-Control`, if present.
pub fn derive_stale_while_revalidate(cache_control: Option<&str>) -> Option<u64> {
    let cc = cache_control?;
    for directive in cc.split(',') {
        let directive = directive.trim();
        if let Some(v) = directive.strip_prefix("stale-while-revalidate=") {
            return v.trim().parse::<u64>().ok();
        }
    }
    None
}

/// Conditional-request matching: `If-None-Match` against a cached ETag.
/// Matches a literal value, `*`, or any entry in a comma-separated list.
pub fn if_none_match_matches(header_value: &str, etag: &str) -> bool {
    let trimmed = header_value.trim();
    if trimmed == "*" {
        return true;
    }
    trimmed.split(',').any(|candidate| candidate.trim() == etag)
}

/// Conditional-request matching: `If-Modified-Since` against a cached
/// `Last-Modified`, both as RFC 2822 / HTTP-date strings. Matches when the
/// request's date is greater than or equal to the entry's.
pub fn if_modified_since_matches(if_modified_since: &str, last_modified: &str) -> bool {
    match (
        httpdate_to_unix(if_modified_since),
        httpdate_to_unix(last_modified),
    ) {
        (Some(ims), Some(lm)) => ims >= lm,
        _ => false,
    }
}

/// Minimal RFC 1123 HTTP-date parser (`Sun, 06 Nov 1994 08:49:37 GMT`),
/// sufficient for conditional-request comparison without pulling in a full
/// date-parsing crate for a single format this gateway itself emits.
fn httpdate_to_unix(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(s.trim())
        .ok()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod response_cache_tests {
    use super::*;

    fn entry(body: &[u8], ttl_secs: u64) -> CachedResponse {
        CachedResponse::new(200, vec![], body.to_vec(), 0, ttl_secs, None)
    }

    #[test]
    fn set_then_get_within_ttl_roundtrips() {
        let cache = ResponseCache::new(10, 1024);
        cache.set("k1".to_string(), entry(b"hello", 60));
        let got = cache.get("k1", 30_000).unwrap();
        assert_eq!(got.body, b"hello");
    }

    #[test]
    fn get_past_ttl_and_no_swr_misses() {
        let cache = ResponseCache::new(10, 1024);
        cache.set("k1".to_string(), entry(b"hello", 10));
        assert!(cache.get("k1", 11_000).is_none());
    }

    #[test]
    fn get_past_ttl_within_swr_still_serves() {
        let cache = ResponseCache::new(10, 1024);
        let mut e = entry(b"hello", 10);
        e.stale_while_revalidate_secs = Some(20);
        cache.set("k1".to_string(), e);
        // 15s old: past the 10s ttl but within the +20s swr window.
        assert!(cache.get("k1", 15_000).is_some());
        // 35s old: past both.
        assert!(cache.get("k1", 35_000).is_none());
    }

    #[test]
    fn oversize_entry_is_rejected_outright() {
        let cache = ResponseCache::new(10, 4);
        assert!(!cache.set("k1".to_string(), entry(b"way too big", 60)));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn evicts_lru_to_make_room_for_new_entry() {
        let cache = ResponseCache::new(2, 1024);
        cache.set("a".to_string(), entry(b"aaa", 60));
        cache.set("b".to_string(), entry(b"bbb", 60));
        cache.set("c".to_string(), entry(b"ccc", 60));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn generate_key_is_stable_for_same_inputs() {
        let k1 = ResponseCache::generate_key("GET", "/data", &[("accept", "json")]);
        let k2 = ResponseCache::generate_key("GET", "/data", &[("accept", "json")]);
        assert_eq!(k1, k2);
    }

    #[test]
    fn generate_key_differs_on_vary_header_value() {
        let k1 = ResponseCache::generate_key("GET", "/data", &[("accept", "json")]);
        let k2 = ResponseCache::generate_key("GET", "/data", &[("accept", "xml")]);
        assert_ne!(k1, k2);
    }

    #[test]
    fn is_cacheable_rejects_non_200_and_unsafe_cache_control() {
        assert!(is_cacheable("GET", 200, None));
        assert!(!is_cacheable("POST", 200, None));
        assert!(!is_cacheable("GET", 404, None));
        assert!(!is_cacheable("GET", 200, Some("no-store")));
        assert!(!is_cacheable("GET", 200, Some("private, max-age=60")));
    }

    #[test]
    fn derive_ttl_prefers_s_maxage_over_max_age() {
        assert_eq!(derive_ttl(Some("max-age=30, s-maxage=90"), 10), 90);
        assert_eq!(derive_ttl(Some("max-age=30"), 10), 30);
        assert_eq!(derive_ttl(None, 10), 10);
    }

    #[test]
    fn if_none_match_matches_wildcard_and_list() {
        assert!(if_none_match_matches("*", "\"abc\""));
        assert!(if_none_match_matches("\"xyz\", \"abc\"", "\"abc\""));
        assert!(!if_none_match_matches("\"xyz\"", "\"abc\""));
    }
}
