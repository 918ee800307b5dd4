use relay_core::config::GatewayConfig;
use relay_core::route::Route;
use relay_core::router::Router;
use relay_core::service::Service;
use relay_core::upstream::{NodeRuntimeTable, Upstream};
use relay_plugin::pipeline::PluginPipeline;
use relay_plugin::plugin::{Phase, PluginContext, PluginResult};
use relay_plugin::registry::PluginRegistry;
use relay_store::cache::{ConfigCache, ResponseCache};
use relay_observability::Aggregator;
use crate::balancer::{LoadBalancer, Node, Strategy};
use crate::breaker::CircuitBreaker;
use crate::compression::CompressionConfig;
use crate::fallback::FallbackHandler;
use crate::retry::RetryManager;
use monoio::net::TcpStream;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

// ── Pre-built static error responses (zero heap alloc) ────────

pub const RESP_404: &[u8] =
    b"HTTP/1.1 404 Not Found\r\ncontent-type: application/json\r\ncontent-length: 41\r\nconnection: keep-alive\r\n\r\n{\"error\":\"no route matched\",\"status\":404}";

pub const RESP_401_INVALID: &[u8] =
    b"HTTP/1.1 401 Unauthorized\r\ncontent-type: application/json\r\ncontent-length: 40\r\nconnection: keep-alive\r\n\r\n{\"error\":\"Invalid API key\",\"status\":401}";

pub const RESP_502: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\ncontent-type: application/json\r\ncontent-length: 39\r\nconnection: keep-alive\r\n\r\n{\"error\":\"upstream error\",\"status\":502}";

// ── ProxyWorker ───────────────────────────────────────────────

/// Per-worker proxy state. Created ONCE per thread, reused across
/// all connections via Rc<RefCell<ProxyWorker>>.
///
/// All caches are plain HashMaps — zero atomics on hot path.
/// DashMap is only touched during config rebuild (cold path).
pub struct ProxyWorker {
    /// Current frozen router.
    router: Arc<Router>,
    /// Router version for cache invalidation.
    router_version: u64,

    // ── Thread-local caches (rebuilt on version change) ──
    pipeline_cache: HashMap<String, Arc<PluginPipeline>>,
    /// One `LoadBalancer` per resolved upstream (keyed by "route:<id>",
    /// "upstream:<id>" or "service:<id>"), rebuilt alongside the pipeline
    /// cache whenever the router version changes.
    balancers: HashMap<String, LoadBalancer>,

    // ── Snapshots from DashMap (cold path only) ──
    upstreams: HashMap<String, Upstream>,
    services: HashMap<String, Service>,
    consumer_keys: HashMap<String, String>,

    // ── Shared immutable ──
    plugin_registry: Arc<PluginRegistry>,
    config_cache: ConfigCache,
    #[allow(dead_code)]
    config: Arc<GatewayConfig>,

    // ── Shared resilience fabric (same instances across all worker threads) ──
    node_runtime: Arc<NodeRuntimeTable>,
    breaker: Arc<CircuitBreaker>,
    retry_manager: Arc<RetryManager>,
    response_cache: Arc<ResponseCache>,
    fallback: Arc<FallbackHandler>,
    compression_config: Arc<CompressionConfig>,
    metrics: Arc<Aggregator>,
}

impl ProxyWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<Router>,
        plugin_registry: Arc<PluginRegistry>,
        config_cache: ConfigCache,
        config: Arc<GatewayConfig>,
        node_runtime: Arc<NodeRuntimeTable>,
        breaker: Arc<CircuitBreaker>,
        retry_manager: Arc<RetryManager>,
        response_cache: Arc<ResponseCache>,
        fallback: Arc<FallbackHandler>,
        compression_config: Arc<CompressionConfig>,
        metrics: Arc<Aggregator>,
    ) -> Self {
        let mut worker = Self {
            router_version: router.version(),
            router,
            pipeline_cache: HashMap::with_capacity(64),
            balancers: HashMap::with_capacity(64),
            upstreams: HashMap::new(),
            services: HashMap::new(),
            consumer_keys: HashMap::new(),
            plugin_registry,
            config_cache,
            config,
            node_runtime,
            breaker,
            retry_manager,
            response_cache,
            fallback,
            compression_config,
            metrics,
        };
        worker.snapshot_from_cache();
        worker
    }

    /// Check for config updates. Called once per accept loop iteration.
    #[inline]
    pub fn maybe_update_router(&mut self, new_router: Arc<Router>) {
        let v = new_router.version();
        if v != self.router_version {
            self.router = new_router;
            self.router_version = v;
            self.pipeline_cache.clear();
            self.balancers.clear();
            self.snapshot_from_cache();
        }
    }

    pub fn node_runtime(&self) -> &Arc<NodeRuntimeTable> {
        &self.node_runtime
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry_manager(&self) -> &Arc<RetryManager> {
        &self.retry_manager
    }

    pub fn response_cache(&self) -> &Arc<ResponseCache> {
        &self.response_cache
    }

    pub fn fallback(&self) -> &Arc<FallbackHandler> {
        &self.fallback
    }

    pub fn compression_config(&self) -> &Arc<CompressionConfig> {
        &self.compression_config
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Aggregator> {
        &self.metrics
    }

    /// Cold path: copy DashMap state into thread-local HashMaps.
    fn snapshot_from_cache(&mut self) {
        self.upstreams.clear();
        for entry in self.config_cache.upstreams.iter() {
            self.upstreams.insert(entry.key().clone(), entry.value().clone());
        }
        self.services.clear();
        for entry in self.config_cache.services.iter() {
            self.services.insert(entry.key().clone(), entry.value().clone());
        }
        self.consumer_keys.clear();
        for entry in self.config_cache.consumer_key_index.iter() {
            self.consumer_keys.insert(entry.key().clone(), entry.value().clone());
        }
    }

    /// Collect all unique upstream addresses from config (for pool pre-warming).
    pub fn upstream_addresses(&self) -> Vec<String> {
        let mut addrs = Vec::new();
        for ups in self.upstreams.values() {
            for addr in ups.nodes.keys() {
                if !addrs.contains(addr) {
                    addrs.push(addr.clone());
                }
            }
        }
        // Also check routes with inline upstreams
        for route in self.router.all_routes() {
            if let Some(ref ups) = route.upstream {
                for addr in ups.nodes.keys() {
                    if !addrs.contains(addr) {
                        addrs.push(addr.clone());
                    }
                }
            }
        }
        addrs
    }

    /// Collect `(upstream_id, node_addrs, config)` for every upstream that
    /// configures an active health check, for the worker thread responsible
    /// for driving probes to spawn one loop per upstream.
    pub fn active_health_checks(
        &self,
    ) -> Vec<(String, Vec<String>, relay_core::upstream::ActiveHealthCheck)> {
        let mut out = Vec::new();
        for (id, ups) in &self.upstreams {
            if let Some(check) = ups
                .health_check
                .as_ref()
                .and_then(|hc| hc.active.clone())
            {
                out.push((id.clone(), ups.nodes.keys().cloned().collect(), check));
            }
        }
        out
    }

    /// Hot path: process request. Returns what to do next.
    ///
    /// Takes &str header references (zero-copy from read buffer).
    /// No DashMap access. No unnecessary allocations.
    #[inline]
    pub fn handle_request(
        &mut self,
        method: &str,
        path: &str,
        host: Option<&str>,
        headers: &[(&str, &str)],
        client_ip: &str,
    ) -> RequestResult {
        // ── Route match — extract data immediately, release borrow ──
        let (route_id, route, path_params) = {
            let route_match = match self.router.match_route(method, path, host) {
                Some(r) => r,
                None => return RequestResult::Static(RESP_404),
            };
            let route_id = route_match.route_id.to_string();
            let route = match self.router.get_route(&route_id) {
                Some(r) => r,
                None => return RequestResult::Static(RESP_404),
            };
            (route_id, route, route_match.params)
        };
        // immutable borrow of self.router is now released

        let has_plugins = !route.plugins.is_empty()
            || route.plugin_config_id.is_some()
            || route.service_id.is_some();

        // ── FAST PATH: no plugins → proxy directly ──
        if !has_plugins {
            let (upstream_addr, max_retries) = self.select_upstream(&route, client_ip);
            return RequestResult::Proxy {
                route_id,
                upstream_addr,
                upstream_path: path.to_string(),
                max_retries,
                pipeline: None,
                ctx: None,
            };
        }

        // ── SLOW PATH: plugin pipeline ──
        let pipeline = self.get_or_build_pipeline(&route_id);

        // Build PluginContext (only for routes WITH plugins)
        let header_map: HashMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect();

        let mut ctx = PluginContext::new(
            method.to_string(),
            path.to_string(),
            header_map,
            client_ip.to_string(),
            route_id.clone(),
        );
        ctx.path_params = path_params.into_iter().collect();
        ctx.service_id = route.service_id.clone();

        // Execute Rewrite + Access phases
        for phase in &[Phase::Rewrite, Phase::Access] {
            match pipeline.execute_phase(*phase, &mut ctx) {
                PluginResult::Continue => {}
                PluginResult::Response { status, headers, body } => {
                    return RequestResult::PluginResponse {
                        route_id,
                        status,
                        headers,
                        body: body.unwrap_or_default(),
                    };
                }
                PluginResult::Error(_) => {
                    return RequestResult::Static(RESP_502);
                }
            }
        }

        // Consumer validation (key-auth)
        if pipeline.has_auth_plugins()
            && let Some(key) = ctx.vars.get("_key_auth_key").and_then(|v| v.as_str())
        {
            match self.consumer_keys.get(key) {
                Some(username) => ctx.consumer = self.config_cache.consumers.get(username).map(|c| c.clone()),
                None => return RequestResult::Static(RESP_401_INVALID),
            }
        }

        // Before proxy phase
        match pipeline.execute_phase(Phase::BeforeProxy, &mut ctx) {
            PluginResult::Continue => {}
            PluginResult::Response { status, headers, body } => {
                return RequestResult::PluginResponse {
                    route_id,
                    status,
                    headers,
                    body: body.unwrap_or_default(),
                };
            }
            PluginResult::Error(_) => {
                return RequestResult::Static(RESP_502);
            }
        }

        let (upstream_addr, max_retries) = self.select_upstream(&route, client_ip);
        let upstream_path = ctx.request_path.clone();
        RequestResult::Proxy {
            route_id,
            upstream_addr,
            upstream_path,
            max_retries,
            pipeline: Some(pipeline),
            ctx: Some(Box::new(ctx)),
        }
    }

    /// Resolve the upstream's node candidates and pick one via its
    /// configured load-balancing strategy. Falls back to a fixed address
    /// with a single attempt when the route carries no upstream at all.
    fn select_upstream(&mut self, route: &Route, client_ip: &str) -> (String, u32) {
        let selection = match Self::find_upstream_selection(route, &self.upstreams, &self.services) {
            Some(s) => s,
            None => return ("127.0.0.1:80".to_string(), 1),
        };
        let retries = selection.retries.max(1);
        let balancer = self.get_or_build_balancer(selection);
        match balancer.select(client_ip, &self.node_runtime) {
            Some(addr) => (addr.to_string(), retries),
            None => ("127.0.0.1:80".to_string(), 1),
        }
    }

    /// Re-select a node for a route already resolved once (used by the
    /// retry loop in `connection.rs` to fail over to a different node
    /// instead of hammering the same one).
    pub fn select_upstream_node(&mut self, route_id: &str, client_ip: &str) -> Option<String> {
        let route = self.router.get_route(route_id)?;
        let selection = Self::find_upstream_selection(&route, &self.upstreams, &self.services)?;
        let balancer = self.get_or_build_balancer(selection);
        balancer.select(client_ip, &self.node_runtime).map(|a| a.to_string())
    }

    fn find_upstream_selection(
        route: &Route,
        upstreams: &HashMap<String, Upstream>,
        services: &HashMap<String, Service>,
    ) -> Option<UpstreamSelection> {
        if let Some(ref ups) = route.upstream {
            return Some(UpstreamSelection {
                key: format!("route:{}", route.id),
                lb_type: ups.r#type.clone(),
                nodes: ups.nodes.clone(),
                retries: ups.retries,
            });
        }
        if let Some(ref id) = route.upstream_id
            && let Some(ups) = upstreams.get(id)
        {
            return Some(UpstreamSelection {
                key: format!("upstream:{}", id),
                lb_type: ups.lb_type.clone(),
                nodes: ups.nodes.clone(),
                retries: ups.retries,
            });
        }
        if let Some(ref svc_id) = route.service_id
            && let Some(svc) = services.get(svc_id)
        {
            if let Some(ref ups) = svc.upstream {
                return Some(UpstreamSelection {
                    key: format!("service:{}", svc_id),
                    lb_type: ups.lb_type.clone(),
                    nodes: ups.nodes.clone(),
                    retries: ups.retries,
                });
            }
            if let Some(ref ups_id) = svc.upstream_id
                && let Some(ups) = upstreams.get(ups_id)
            {
                return Some(UpstreamSelection {
                    key: format!("upstream:{}", ups_id),
                    lb_type: ups.lb_type.clone(),
                    nodes: ups.nodes.clone(),
                    retries: ups.retries,
                });
            }
        }
        None
    }

    fn get_or_build_balancer(&mut self, selection: UpstreamSelection) -> &LoadBalancer {
        self.balancers.entry(selection.key.clone()).or_insert_with(|| {
            let strategy = Strategy::from_upstream_type(&selection.lb_type);
            let nodes = selection
                .nodes
                .into_iter()
                .map(|(addr, weight)| Node { addr, weight })
                .collect();
            LoadBalancer::new(strategy, nodes)
        })
    }

    fn get_or_build_pipeline(&mut self, route_id: &str) -> Arc<PluginPipeline> {
        if let Some(cached) = self.pipeline_cache.get(route_id) {
            return Arc::clone(cached);
        }

        let route = self.router.get_route(route_id);
        let mut merged: HashMap<String, serde_json::Value> = HashMap::new();
        let mut has_auth = false;

        if let Some(route) = route {
            if let Some(ref svc_id) = route.service_id
                && let Some(svc) = self.services.get(svc_id)
            {
                for (name, config) in &svc.plugins {
                    merged.insert(name.clone(), config.clone());
                }
            }
            for (name, config) in &route.plugins {
                merged.insert(name.clone(), config.clone());
            }
        }

        let mut instances: Vec<Arc<dyn relay_plugin::plugin::PluginInstance>> = Vec::new();
        for (name, config) in &merged {
            if matches!(name.as_str(), "key-auth" | "jwt-auth" | "basic-auth") {
                has_auth = true;
            }
            if let Some(factory) = self.plugin_registry.get(name)
                && let Ok(inst) = factory.configure(config)
            {
                instances.push(Arc::from(inst));
            }
        }

        let pipeline = Arc::new(PluginPipeline::build(instances, has_auth));
        self.pipeline_cache.insert(route_id.to_string(), Arc::clone(&pipeline));
        pipeline
    }
}

/// Candidate node set for one resolved upstream (inline, by-id, or via a
/// service), normalized so `select_upstream` doesn't care which of the
/// three config shapes it came from.
struct UpstreamSelection {
    key: String,
    lb_type: String,
    nodes: HashMap<String, u32>,
    retries: u32,
}

// ── Request result ────────────────────────────────────────────

pub enum RequestResult {
    /// Proxy to upstream at this address.
    Proxy {
        /// Route ID, kept so the connection handler can re-run load
        /// balancer selection against a different node on retry.
        route_id: String,
        upstream_addr: String,
        /// Request path (and query) forwarded upstream — may differ from
        /// the original request path if a rewrite plugin ran.
        upstream_path: String,
        /// Maximum attempts (1 = no retry) for this request.
        max_retries: u32,
        /// The route's plugin pipeline, carried along so the connection
        /// handler can run `HeaderFilter`/`BodyFilter`/`Log` once the
        /// upstream response comes back. `None` on the no-plugin fast path.
        pipeline: Option<Arc<PluginPipeline>>,
        /// Owned plugin context built for this request, populated with the
        /// response once it's available so response-phase plugins see both
        /// sides of the exchange.
        ctx: Option<Box<PluginContext>>,
    },
    /// Send a pre-built static response (zero alloc).
    Static(&'static [u8]),
    /// Send a plugin-generated response.
    PluginResponse {
        /// Route that produced this response, for metrics attribution.
        route_id: String,
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
}

impl std::fmt::Debug for RequestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestResult::Proxy {
                route_id,
                upstream_addr,
                upstream_path,
                max_retries,
                ..
            } => f
                .debug_struct("Proxy")
                .field("route_id", route_id)
                .field("upstream_addr", upstream_addr)
                .field("upstream_path", upstream_path)
                .field("max_retries", max_retries)
                .finish_non_exhaustive(),
            RequestResult::Static(_) => write!(f, "Static(..)"),
            RequestResult::PluginResponse { status, .. } => {
                f.debug_struct("PluginResponse").field("status", status).finish_non_exhaustive()
            }
        }
    }
}

// ── Connection pool ───────────────────────────────────────────

/// Thread-local upstream connection pool.
/// Avoids TCP handshake on every request (saves ~0.5-2ms RTT).
///
/// Pre-warmed at startup: each worker opens N connections to every
/// known upstream before accepting any traffic.
pub struct ConnPool {
    pools: HashMap<String, VecDeque<TcpStream>>,
    max_idle: usize,
}

impl ConnPool {
    pub fn new(max_idle_per_host: usize) -> Self {
        Self {
            pools: HashMap::with_capacity(16),
            max_idle: max_idle_per_host,
        }
    }

    #[inline]
    pub fn take(&mut self, addr: &str) -> Option<TcpStream> {
        self.pools.get_mut(addr).and_then(|q| q.pop_front())
    }

    #[inline]
    pub fn put(&mut self, addr: String, stream: TcpStream) {
        let queue = self.pools.entry(addr).or_insert_with(|| VecDeque::with_capacity(self.max_idle));
        if queue.len() < self.max_idle {
            queue.push_back(stream);
        }
        // else: drop stream (closes fd)
    }

    /// Pre-warm connection pool: open `count` connections to each addr.
    /// Called once at worker startup, before accepting any traffic.
    pub async fn warm(&mut self, addrs: &[String], count: usize) {
        for addr in addrs {
            let target = count.min(self.max_idle);
            let queue = self.pools.entry(addr.clone()).or_insert_with(|| VecDeque::with_capacity(target));
            for _ in 0..target {
                match TcpStream::connect(addr.as_str()).await {
                    Ok(stream) => {
                        // Set TCP_NODELAY on pooled connections
                        let _ = stream.set_nodelay(true);
                        queue.push_back(stream);
                    }
                    Err(e) => {
                        tracing::warn!(addr = %addr, error = %e, "Pool pre-warm connect failed");
                        break; // upstream not yet up — stop trying this addr
                    }
                }
            }
            if !queue.is_empty() {
                tracing::info!(addr = %addr, conns = queue.len(), "Pool pre-warmed");
            }
        }
    }
}

// ── Response building helpers ─────────────────────────────────

/// Build HTTP response into a buffer (no format! overhead).
pub fn build_response(buf: &mut Vec<u8>, status: u16, headers: &[(String, String)], body: &[u8]) {
    buf.clear();
    buf.extend_from_slice(b"HTTP/1.1 ");
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(itoa_buf.format(status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status_text(status).as_bytes());
    buf.extend_from_slice(b"\r\ncontent-length: ");
    buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    buf.extend_from_slice(b"\r\nconnection: keep-alive\r\n");
    for (k, v) in headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
}

/// Build upstream HTTP request into a buffer. Zero-copy from &str refs.
pub fn build_upstream_request(
    buf: &mut Vec<u8>,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) {
    buf.clear();
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("upgrade")
        {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"connection: keep-alive\r\n");
    if !body.is_empty() {
        buf.extend_from_slice(b"content-length: ");
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    if !body.is_empty() {
        buf.extend_from_slice(body);
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
