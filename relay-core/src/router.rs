use crate::route::Route;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Thread-safe, high-performance router using a hand-rolled radix tree.
///
/// Route URIs use `{name}` for a single-segment parameter and `{*name}` for
/// a trailing catch-all, mirroring the route definitions already stored on
/// [`Route`]. Matching walks the tree depth-first and backtracks: a static
/// segment is tried first, then the parameter child, then the wildcard —
/// and if a deeper branch fails to produce a match, the search unwinds and
/// tries the next-priority sibling at that level rather than committing to
/// the first segment-level match found.
///
/// Optimisation: host constraints are pre-compiled into the `CompiledRouter`
/// so `match_route` never touches the `routes` DashMap on the hot path.
pub struct Router {
    /// Current compiled route tree
    inner: arc_swap::ArcSwap<CompiledRouter>,

    /// Source of truth: all registered routes by ID
    routes: DashMap<String, Route>,

    /// Monotonically-increasing version, bumped on every rebuild.
    /// Used by the proxy to invalidate its pipeline cache.
    version: AtomicU64,
}

/// Pre-compiled host constraints for a route (stored inside the compiled router).
#[derive(Clone, Debug)]
struct HostConstraint {
    /// Exact hosts (no wildcards).
    exact: Vec<String>,
    /// Wildcard suffixes (e.g. `*.example.com` → `.example.com`).
    wildcard_suffixes: Vec<String>,
}

impl HostConstraint {
    fn from_route(route: &Route) -> Self {
        let hosts = route.all_hosts();
        let mut exact = Vec::new();
        let mut wildcard_suffixes = Vec::new();
        for h in hosts {
            if h.starts_with('*') {
                wildcard_suffixes.push(h[1..].to_string());
            } else {
                exact.push(h.to_string());
            }
        }
        Self {
            exact,
            wildcard_suffixes,
        }
    }

    /// Returns `true` if there are no host constraints (route matches any host).
    #[inline(always)]
    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard_suffixes.is_empty()
    }

    /// Check if the given `request_host` satisfies this constraint.
    #[inline]
    fn matches(&self, request_host: Option<&str>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(host) = request_host else {
            return false;
        };
        let host = host.split(':').next().unwrap_or(host);
        for h in &self.exact {
            if h == host {
                return true;
            }
        }
        for suffix in &self.wildcard_suffixes {
            if host.ends_with(suffix.as_str()) {
                return true;
            }
        }
        false
    }
}

/// One level of the radix tree. Children are partitioned by kind so that
/// matching can try them in deterministic priority order: static, then
/// parameter, then wildcard.
struct Node<T> {
    static_children: HashMap<String, Node<T>>,
    param_child: Option<Box<ParamChild<T>>>,
    /// A trailing `{*name}` catch-all. Always terminal: it has no children
    /// of its own, it just captures everything remaining in the path.
    wildcard: Option<(String, T)>,
    /// Value stored when this exact node is itself a route (path ends here).
    value: Option<T>,
}

struct ParamChild<T> {
    name: String,
    node: Node<T>,
}

impl<T> Node<T> {
    fn empty() -> Self {
        Self {
            static_children: HashMap::new(),
            param_child: None,
            wildcard: None,
            value: None,
        }
    }
}

impl<T: Clone> Node<T> {
    fn insert(&mut self, segments: &[&str], value: T) {
        let Some((seg, rest)) = segments.split_first() else {
            self.value = Some(value);
            return;
        };

        if let Some(name) = seg.strip_prefix("{*").and_then(|s| s.strip_suffix('}')) {
            self.wildcard = Some((name.to_string(), value));
            return;
        }

        if let Some(name) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            let child = self.param_child.get_or_insert_with(|| {
                Box::new(ParamChild {
                    name: name.to_string(),
                    node: Node::empty(),
                })
            });
            child.node.insert(rest, value);
            return;
        }

        let child = self
            .static_children
            .entry((*seg).to_string())
            .or_insert_with(Node::empty);
        child.insert(rest, value);
    }

    /// Depth-first match with backtracking. Returns the matched value and
    /// appends captured parameters to `params` in match order.
    fn matches<'p>(
        &self,
        segments: &[&'p str],
        params: &mut Vec<(String, String)>,
    ) -> Option<T> {
        let Some((seg, rest)) = segments.split_first() else {
            return self.value.clone();
        };

        if let Some(child) = self.static_children.get(*seg) {
            if let Some(v) = child.matches(rest, params) {
                return Some(v);
            }
        }

        if let Some(pc) = &self.param_child {
            let mark = params.len();
            params.push((pc.name.clone(), (*seg).to_string()));
            if let Some(v) = pc.node.matches(rest, params) {
                return Some(v);
            }
            params.truncate(mark);
        }

        if let Some((name, v)) = &self.wildcard {
            let tail = std::iter::once(*seg)
                .chain(rest.iter().copied())
                .collect::<Vec<_>>()
                .join("/");
            params.push((name.clone(), tail));
            return Some(v.clone());
        }

        None
    }
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

struct CompiledRouter {
    /// Method-specific trees for faster matching
    method_routers: HashMap<String, Node<Arc<str>>>,

    /// Catch-all tree (for routes with no method constraint)
    any_method_router: Node<Arc<str>>,

    /// Pre-compiled host constraints indexed by route_id.
    host_constraints: HashMap<Arc<str>, HostConstraint>,
}

/// Result of a route match.
#[derive(Debug)]
pub struct RouteMatch {
    /// The matched route ID — Arc<str> avoids a heap allocation per request
    /// (just an atomic increment to clone the Arc from the compiled router).
    pub route_id: Arc<str>,

    /// Extracted path parameters
    pub params: Vec<(String, String)>,
}

impl Router {
    pub fn new() -> Self {
        let compiled = CompiledRouter {
            method_routers: HashMap::new(),
            any_method_router: Node::empty(),
            host_constraints: HashMap::new(),
        };

        Self {
            inner: arc_swap::ArcSwap::new(Arc::new(compiled)),
            routes: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    /// Returns the current route table version.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Build a router from a route set, stamped with an explicit version.
    ///
    /// Used by config sync (and tests) to construct a fully-compiled router
    /// whose version is known up front, rather than relying on the implicit
    /// post-`add_route` increment — callers that swap in a whole new router
    /// via `ArcSwap` need the version to match what they're about to publish.
    pub fn build(routes: Vec<Route>, version: u64) -> anyhow::Result<Self> {
        let router = Self::new();
        for route in routes {
            router.routes.insert(route.id.clone(), route);
        }
        router.rebuild()?;
        router.version.store(version, Ordering::Release);
        Ok(router)
    }

    /// Add or update a route. Triggers recompilation of the route tree.
    pub fn add_route(&self, route: Route) -> anyhow::Result<()> {
        info!(route_id = %route.id, uri = %route.uri, "Adding route");
        self.routes.insert(route.id.clone(), route);
        self.rebuild()
    }

    /// Remove a route by ID. Triggers recompilation.
    pub fn remove_route(&self, route_id: &str) -> anyhow::Result<()> {
        info!(route_id = %route_id, "Removing route");
        self.routes.remove(route_id);
        self.rebuild()
    }

    /// Get a route by ID.
    #[inline]
    pub fn get_route(&self, route_id: &str) -> Option<Route> {
        self.routes.get(route_id).map(|r| r.clone())
    }

    /// Get all routes.
    pub fn all_routes(&self) -> Vec<Route> {
        self.routes.iter().map(|r| r.value().clone()).collect()
    }

    /// Match an incoming request against registered routes.
    ///
    /// Hot-path optimised: uses an `arc_swap::Guard` (not `Arc::clone`),
    /// and checks pre-compiled host constraints without touching the DashMap.
    #[inline]
    pub fn match_route(&self, method: &str, path: &str, host: Option<&str>) -> Option<RouteMatch> {
        let compiled = self.inner.load();
        let segments = path_segments(path);

        if let Some(method_router) = compiled.method_routers.get(method) {
            let mut params = Vec::new();
            if let Some(route_id) = method_router.matches(&segments, &mut params) {
                if self.check_host_fast(&compiled, &route_id, host) {
                    return Some(RouteMatch { route_id, params });
                }
            }
        }

        let mut params = Vec::new();
        if let Some(route_id) = compiled.any_method_router.matches(&segments, &mut params) {
            if self.check_host_fast(&compiled, &route_id, host) {
                return Some(RouteMatch { route_id, params });
            }
        }

        None
    }

    /// Fast host constraint check using pre-compiled data in CompiledRouter
    /// (no DashMap lookup).
    #[inline(always)]
    fn check_host_fast(
        &self,
        compiled: &CompiledRouter,
        route_id: &str,
        request_host: Option<&str>,
    ) -> bool {
        match compiled.host_constraints.get(route_id) {
            Some(hc) => hc.matches(request_host),
            None => true, // No constraint entry → matches everything
        }
    }

    /// Rebuild the compiled router from current routes.
    ///
    /// This is called automatically by `add_route` / `remove_route`, but
    /// can also be called manually after a batch of concurrent mutations
    /// to guarantee the compiled tree is fully up-to-date.
    pub fn rebuild(&self) -> anyhow::Result<()> {
        let mut method_routers: HashMap<String, Node<Arc<str>>> = HashMap::new();
        let mut any_method_router = Node::empty();
        let mut host_constraints: HashMap<Arc<str>, HostConstraint> = HashMap::new();

        // Sort routes by priority (higher first) so that, for overlapping
        // patterns inserted into the same tree, the higher-priority route's
        // terminal `value` wins the insert at a shared node.
        let mut routes: Vec<Route> = self.routes.iter().map(|r| r.value().clone()).collect();
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));

        for route in &routes {
            if !route.is_active() {
                continue;
            }

            let route_id_arc: Arc<str> = Arc::from(route.id.as_str());

            let hc = HostConstraint::from_route(route);
            if !hc.is_empty() {
                host_constraints.insert(Arc::clone(&route_id_arc), hc);
            }

            for uri in route.all_uris() {
                let segments = path_segments(uri);
                if route.methods.is_empty() {
                    any_method_router.insert(&segments, Arc::clone(&route_id_arc));
                } else {
                    for method in &route.methods {
                        let tree = method_routers
                            .entry(method.as_str().to_string())
                            .or_insert_with(Node::empty);
                        tree.insert(&segments, Arc::clone(&route_id_arc));
                    }
                }
            }
        }

        let compiled = CompiledRouter {
            method_routers,
            any_method_router,
            host_constraints,
        };

        self.inner.store(Arc::new(compiled));
        self.version.fetch_add(1, Ordering::Release);
        info!(count = routes.len(), "Router rebuilt");
        Ok(())
    }

    /// Get the total number of registered routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Replace all routes atomically (used during config sync).
    pub fn replace_all(&self, routes: Vec<Route>) -> anyhow::Result<()> {
        self.routes.clear();
        for route in routes {
            self.routes.insert(route.id.clone(), route);
        }
        self.rebuild()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{HttpMethod, Route};

    fn test_route(id: &str, uri: &str, methods: Vec<HttpMethod>) -> Route {
        Route {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            uri: uri.to_string(),
            uris: vec![],
            methods,
            host: None,
            hosts: vec![],
            remote_addrs: vec![],
            vars: vec![],
            priority: 0,
            enable: true,
            upstream: None,
            upstream_id: None,
            service_id: None,
            plugins: std::collections::HashMap::new(),
            plugin_config_id: None,
            labels: std::collections::HashMap::new(),
            status: 1,
            timeout: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_basic_route_matching() {
        let router = Router::new();
        router
            .add_route(test_route("r1", "/api/users", vec![HttpMethod::Get]))
            .unwrap();
        router
            .add_route(test_route(
                "r2",
                "/api/users",
                vec![HttpMethod::Post],
            ))
            .unwrap();

        let m = router.match_route("GET", "/api/users", None);
        assert!(m.is_some());
        assert_eq!(m.unwrap().route_id.as_ref(), "r1");

        let m = router.match_route("POST", "/api/users", None);
        assert!(m.is_some());
        assert_eq!(m.unwrap().route_id.as_ref(), "r2");

        let m = router.match_route("DELETE", "/api/users", None);
        assert!(m.is_none());
    }

    #[test]
    fn test_parametric_route() {
        let router = Router::new();
        router
            .add_route(test_route("r1", "/api/users/{id}", vec![]))
            .unwrap();

        let m = router.match_route("GET", "/api/users/123", None).unwrap();
        assert_eq!(m.route_id.as_ref(), "r1");
        assert_eq!(m.params[0], ("id".to_string(), "123".to_string()));
    }

    #[test]
    fn test_wildcard_host_matching() {
        let router = Router::new();
        let mut route = test_route("r1", "/api", vec![]);
        route.host = Some("*.example.com".to_string());
        router.add_route(route).unwrap();

        let m = router.match_route("GET", "/api", Some("foo.example.com"));
        assert!(m.is_some());

        let m = router.match_route("GET", "/api", Some("other.com"));
        assert!(m.is_none());
    }

    #[test]
    fn static_route_takes_priority_over_parametric_sibling() {
        let router = Router::new();
        router
            .add_route(test_route("static", "/api/users/me", vec![]))
            .unwrap();
        router
            .add_route(test_route("param", "/api/users/{id}", vec![]))
            .unwrap();

        let m = router.match_route("GET", "/api/users/me", None).unwrap();
        assert_eq!(m.route_id.as_ref(), "static");

        let m = router.match_route("GET", "/api/users/42", None).unwrap();
        assert_eq!(m.route_id.as_ref(), "param");
    }

    #[test]
    fn wildcard_catches_remaining_segments_as_a_single_param() {
        let router = Router::new();
        router
            .add_route(test_route("assets", "/static/{*rest}", vec![]))
            .unwrap();

        let m = router
            .match_route("GET", "/static/js/app.min.js", None)
            .unwrap();
        assert_eq!(m.route_id.as_ref(), "assets");
        assert_eq!(m.params[0], ("rest".to_string(), "js/app.min.js".to_string()));
    }

    #[test]
    fn failed_parameter_branch_backtracks_to_wildcard_sibling() {
        let router = Router::new();
        // /files/{id}/meta only matches a 2-segment tail; anything deeper
        // under /files must fall through to the wildcard catch-all.
        router
            .add_route(test_route("meta", "/files/{id}/meta", vec![]))
            .unwrap();
        router
            .add_route(test_route("raw", "/files/{*path}", vec![]))
            .unwrap();

        let m = router.match_route("GET", "/files/42/meta", None).unwrap();
        assert_eq!(m.route_id.as_ref(), "meta");

        // "42/meta/extra" doesn't fit the param route's shape (3 segments
        // vs 2 after /files), so it must backtrack to the wildcard.
        let m = router
            .match_route("GET", "/files/42/meta/extra", None)
            .unwrap();
        assert_eq!(m.route_id.as_ref(), "raw");
        assert_eq!(
            m.params[0],
            ("path".to_string(), "42/meta/extra".to_string())
        );
    }

    #[test]
    fn root_path_matches_empty_segment_list() {
        let router = Router::new();
        router.add_route(test_route("root", "/", vec![])).unwrap();
        let m = router.match_route("GET", "/", None);
        assert!(m.is_some());
        assert_eq!(m.unwrap().route_id.as_ref(), "root");
    }
}
