use serde_json::Value;
use std::collections::HashMap;
use relay_core::consumer::Consumer;

/// Plugin execution phases, matching APISIX's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Modify request before routing takes place
    Rewrite = 0,
    /// Authentication, authorization, rate limiting
    Access = 1,
    /// Just before proxying to upstream
    BeforeProxy = 2,
    /// Modify response headers from upstream
    HeaderFilter = 3,
    /// Modify response body from upstream
    BodyFilter = 4,
    /// Post-response logging (non-blocking)
    Log = 5,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Rewrite => "rewrite",
            Phase::Access => "access",
            Phase::BeforeProxy => "before_proxy",
            Phase::HeaderFilter => "header_filter",
            Phase::BodyFilter => "body_filter",
            Phase::Log => "log",
        }
    }

    pub fn all() -> &'static [Phase] {
        &[
            Phase::Rewrite,
            Phase::Access,
            Phase::BeforeProxy,
            Phase::HeaderFilter,
            Phase::BodyFilter,
            Phase::Log,
        ]
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of plugin execution.
#[derive(Debug)]
pub enum PluginResult {
    /// Continue to the next plugin / phase
    Continue,

    /// Short-circuit with a response (e.g., 401, 403, 429)
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },

    /// Error during plugin execution
    Error(String),
}

/// Mutable context passed through the plugin pipeline for each request.
pub struct PluginContext {
    // --- Request data ---
    pub request_method: String,
    pub request_uri: String,
    pub request_path: String,
    pub request_query: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<Vec<u8>>,

    /// Path parameters from router matching
    pub path_params: HashMap<String, String>,

    /// Client IP address
    pub client_ip: String,

    // --- Response data (populated after upstream response) ---
    pub response_status: Option<u16>,
    pub response_headers: HashMap<String, String>,
    pub response_body: Option<Vec<u8>>,

    // --- Plugin data ---
    /// Shared context between plugins (key-value store)
    pub vars: HashMap<String, Value>,

    /// Consumer identified by auth plugins
    pub consumer: Option<Consumer>,

    /// Route matched
    pub route_id: String,

    /// Service ID (if any)
    pub service_id: Option<String>,

    // --- Timing ---
    pub request_start: std::time::Instant,

    // --- Upstream selection ---
    pub upstream_addr: Option<String>,

    /// Snapshot of consumers for auth plugins to validate against
    /// (populated by the proxy before the plugin pipeline runs)
    pub consumers: HashMap<String, Consumer>,
}

impl PluginContext {
    pub fn new(
        method: String,
        uri: String,
        headers: HashMap<String, String>,
        client_ip: String,
        route_id: String,
    ) -> Self {
        // Parse path and query from URI
        let (path, query) = match uri.find('?') {
            Some(pos) => (uri[..pos].to_string(), uri[pos + 1..].to_string()),
            None => (uri.clone(), String::new()),
        };

        Self {
            request_method: method,
            request_uri: uri,
            request_path: path,
            request_query: query,
            request_headers: headers,
            request_body: None,
            path_params: HashMap::new(),
            client_ip,
            response_status: None,
            response_headers: HashMap::new(),
            response_body: None,
            vars: HashMap::new(),
            consumer: None,
            route_id,
            service_id: None,
            request_start: std::time::Instant::now(),
            upstream_addr: None,
            consumers: HashMap::new(),
        }
    }

    /// Get a request header (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.request_headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }

    /// Set a request header.
    pub fn set_header(&mut self, name: String, value: String) {
        self.request_headers.insert(name, value);
    }

    /// Remove a request header.
    pub fn remove_header(&mut self, name: &str) {
        let lower = name.to_lowercase();
        self.request_headers
            .retain(|k, _| k.to_lowercase() != lower);
    }

    /// Set a response header.
    pub fn set_response_header(&mut self, name: String, value: String) {
        self.response_headers.insert(name, value);
    }

    /// Get elapsed time since request start.
    pub fn elapsed_ms(&self) -> f64 {
        self.request_start.elapsed().as_secs_f64() * 1000.0
    }

    /// Set a context variable (shared between plugins).
    pub fn set_var(&mut self, key: String, value: Value) {
        self.vars.insert(key, value);
    }

    /// Get a context variable.
    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }
}

/// A plugin factory: stateless, shared across every route that configures it.
///
/// `configure` is called once per distinct `(plugin, config)` pair encountered
/// while building a route's pipeline, and the resulting `PluginInstance` is
/// cached — so any per-request state (counters, buffers) lives in the
/// instance, not the factory.
pub trait Plugin: Send + Sync {
    /// Plugin name (must be unique)
    fn name(&self) -> &str;

    /// Plugin priority (higher = executed first within a phase)
    fn priority(&self) -> i32 {
        0
    }

    /// Which phases this plugin participates in by default. The pipeline
    /// builder trusts the concrete `PluginInstance`'s own `phases()` at
    /// registration time, since a single plugin may narrow or widen its
    /// phase set based on configuration.
    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    /// Validate and bind a route's plugin configuration, returning a
    /// ready-to-run instance.
    fn configure(&self, config: &Value) -> anyhow::Result<Box<dyn PluginInstance>>;
}

/// A plugin bound to one route's configuration. Implementations override
/// only the phase methods they participate in — the rest fall through to
/// `Continue`.
pub trait PluginInstance: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    /// Phases this instance should be registered under. Defaults to
    /// `[Access]`; plugins that hook other phases (or several) override it.
    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    fn rewrite(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn access(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn before_proxy(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn header_filter(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn body_filter(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn log(&self, ctx: &mut PluginContext) {
        let _ = ctx;
    }
}
