//! Fallback handler (spec §4.8): static, stale-cache, and default-template
//! responses served when the pipeline can't reach an upstream.
//!
//! Grounded on `breaker.rs`/`retry.rs`'s shape — a small, stateless-ish
//! rule engine over shared state, callable from any worker thread. The
//! stale-cache half needs a bounded map of recent good responses, which
//! reuses the `DashMap` idiom `relay-store::cache::ConfigCache` already
//! uses for concurrent keyed state.

use dashmap::DashMap;
use std::sync::Arc;

/// A cached good response kept around solely to serve stale-on-error.
#[derive(Debug, Clone)]
pub struct FallbackCacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub cached_at_ms: u64,
    pub ttl_ms: u64,
}

/// A statically configured fallback response for a route or upstream.
#[derive(Debug, Clone)]
pub struct StaticFallback {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A classification of the failure that triggered the fallback lookup,
/// used to pick the default-template status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackError {
    CircuitOpen,
    Timeout,
    Gateway(u16),
    Other,
}

impl FallbackError {
    fn default_status(&self) -> u16 {
        match self {
            FallbackError::CircuitOpen => 503,
            FallbackError::Timeout => 504,
            FallbackError::Gateway(code) => *code,
            FallbackError::Other => 503,
        }
    }
}

pub struct FallbackResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Maximum age (age ≤ ttl + max_stale_age) a stale cache entry may still be
/// served at.
#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    pub max_stale_age_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_stale_age_ms: 60_000,
        }
    }
}

/// `route⊕upstream` is the cache/static key, matching spec §3's tuple key.
fn cache_key(route: &str, upstream_id: Option<&str>) -> String {
    match upstream_id {
        Some(u) => format!("{route}\u{0}{u}"),
        None => route.to_string(),
    }
}

pub struct FallbackHandler {
    config: FallbackConfig,
    static_by_route: DashMap<String, StaticFallback>,
    static_by_upstream: DashMap<String, StaticFallback>,
    stale_cache: DashMap<String, FallbackCacheEntry>,
    templates: DashMap<u16, Vec<u8>>,
}

impl FallbackHandler {
    pub fn new(config: FallbackConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            static_by_route: DashMap::new(),
            static_by_upstream: DashMap::new(),
            stale_cache: DashMap::new(),
            templates: DashMap::new(),
        })
    }

    pub fn register_static_by_route(&self, route: impl Into<String>, fallback: StaticFallback) {
        self.static_by_route.insert(route.into(), fallback);
    }

    pub fn register_static_by_upstream(&self, upstream_id: impl Into<String>, fallback: StaticFallback) {
        self.static_by_upstream.insert(upstream_id.into(), fallback);
    }

    pub fn register_template(&self, status: u16, body: Vec<u8>) {
        self.templates.insert(status, body);
    }

    /// Resolution order per spec §4.8: static-by-route, static-by-upstream,
    /// stale-on-error cache, default template.
    pub fn get_fallback(
        &self,
        route: &str,
        upstream_id: Option<&str>,
        error: FallbackError,
        now_ms: u64,
    ) -> FallbackResponse {
        if let Some(f) = self.static_by_route.get(route) {
            return FallbackResponse {
                status: f.status,
                headers: f.headers.clone(),
                body: f.body.clone(),
            };
        }
        if let Some(upstream_id) = upstream_id {
            if let Some(f) = self.static_by_upstream.get(upstream_id) {
                return FallbackResponse {
                    status: f.status,
                    headers: f.headers.clone(),
                    body: f.body.clone(),
                };
            }
        }

        let key = cache_key(route, upstream_id);
        if let Some(entry) = self.stale_cache.get(&key) {
            let age = now_ms.saturating_sub(entry.cached_at_ms);
            if age <= entry.ttl_ms.saturating_add(self.config.max_stale_age_ms) {
                let mut headers = entry.headers.clone();
                headers.push(("warning".to_string(), "110 - \"Response is Stale\"".to_string()));
                headers.push(("x-served-from-cache".to_string(), "true".to_string()));
                return FallbackResponse {
                    status: entry.status,
                    headers,
                    body: entry.body.clone(),
                };
            }
        }

        let status = error.default_status();
        let body = self
            .templates
            .get(&status)
            .map(|t| t.value().clone())
            .unwrap_or_else(|| {
                format!(r#"{{"code":"SERVICE_ERROR","status":{status}}}"#).into_bytes()
            });
        FallbackResponse {
            status,
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("x-fallback-response".to_string(), "true".to_string()),
            ],
            body,
        }
    }

    /// Record a known-good response for later stale-on-error serving.
    pub fn cache_response(
        &self,
        route: &str,
        upstream_id: Option<&str>,
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        cached_at_ms: u64,
        ttl_ms: u64,
    ) {
        let key = cache_key(route, upstream_id);
        self.stale_cache.insert(
            key,
            FallbackCacheEntry {
                status,
                headers,
                body,
                cached_at_ms,
                ttl_ms,
            },
        );
    }

    /// Evict stale-cache entries whose age exceeds ttl + max_stale_age.
    pub fn cleanup(&self, now_ms: u64) {
        self.stale_cache.retain(|_, entry| {
            let age = now_ms.saturating_sub(entry.cached_at_ms);
            age <= entry.ttl_ms.saturating_add(self.config.max_stale_age_ms)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &[u8]) -> StaticFallback {
        StaticFallback {
            status: 200,
            headers: vec![],
            body: body.to_vec(),
        }
    }

    #[test]
    fn static_by_route_wins_over_everything() {
        let handler = FallbackHandler::new(FallbackConfig::default());
        handler.register_static_by_route("r1", entry(b"route fallback"));
        handler.register_static_by_upstream("u1", entry(b"upstream fallback"));

        let resp = handler.get_fallback("r1", Some("u1"), FallbackError::Other, 0);
        assert_eq!(resp.body, b"route fallback");
    }

    #[test]
    fn static_by_upstream_used_when_no_route_match() {
        let handler = FallbackHandler::new(FallbackConfig::default());
        handler.register_static_by_upstream("u1", entry(b"upstream fallback"));

        let resp = handler.get_fallback("r1", Some("u1"), FallbackError::Other, 0);
        assert_eq!(resp.body, b"upstream fallback");
    }

    #[test]
    fn stale_cache_served_within_tolerance_with_markers() {
        let handler = FallbackHandler::new(FallbackConfig {
            max_stale_age_ms: 5_000,
        });
        handler.cache_response("r1", Some("u1"), 200, vec![], b"cached body".to_vec(), 0, 1_000);

        // age 3000ms: past ttl (1000) but within ttl+max_stale_age (6000)
        let resp = handler.get_fallback("r1", Some("u1"), FallbackError::Other, 3_000);
        assert_eq!(resp.body, b"cached body");
        assert!(resp.headers.iter().any(|(k, _)| k == "x-served-from-cache"));
        assert!(resp.headers.iter().any(|(k, v)| k == "warning" && v.contains("Stale")));
    }

    #[test]
    fn stale_cache_expired_falls_through_to_template() {
        let handler = FallbackHandler::new(FallbackConfig {
            max_stale_age_ms: 1_000,
        });
        handler.cache_response("r1", Some("u1"), 200, vec![], b"cached body".to_vec(), 0, 1_000);

        // age 5000ms: past ttl(1000)+max_stale(1000)
        let resp = handler.get_fallback("r1", Some("u1"), FallbackError::CircuitOpen, 5_000);
        assert_eq!(resp.status, 503);
        assert!(resp.headers.iter().any(|(k, _)| k == "x-fallback-response"));
    }

    #[test]
    fn default_status_by_error_kind() {
        let handler = FallbackHandler::new(FallbackConfig::default());
        assert_eq!(
            handler.get_fallback("none", None, FallbackError::CircuitOpen, 0).status,
            503
        );
        assert_eq!(
            handler.get_fallback("none", None, FallbackError::Timeout, 0).status,
            504
        );
        assert_eq!(
            handler.get_fallback("none", None, FallbackError::Gateway(502), 0).status,
            502
        );
    }

    #[test]
    fn registered_template_overrides_generic_body() {
        let handler = FallbackHandler::new(FallbackConfig::default());
        handler.register_template(503, br#"{"custom":"down for maintenance"}"#.to_vec());
        let resp = handler.get_fallback("none", None, FallbackError::CircuitOpen, 0);
        assert_eq!(resp.body, br#"{"custom":"down for maintenance"}"#);
    }

    #[test]
    fn cleanup_evicts_entries_past_tolerance() {
        let handler = FallbackHandler::new(FallbackConfig {
            max_stale_age_ms: 1_000,
        });
        handler.cache_response("r1", None, 200, vec![], b"x".to_vec(), 0, 1_000);
        handler.cleanup(5_000);
        let resp = handler.get_fallback("r1", None, FallbackError::Other, 5_000);
        // no stale entry left, falls to default template
        assert_eq!(resp.status, 503);
    }
}
