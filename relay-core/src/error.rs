use crate::pii::redact;
use thiserror::Error;

/// Where a timeout occurred, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOrigin {
    Connection,
    Request,
    Upstream,
    Plugin,
}

impl TimeoutOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutOrigin::Connection => "connection",
            TimeoutOrigin::Request => "request",
            TimeoutOrigin::Upstream => "upstream",
            TimeoutOrigin::Plugin => "plugin",
        }
    }
}

/// Error category used by the metrics aggregator (spec §4.15 / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Client,
    Server,
    Network,
    Timeout,
    CircuitBreaker,
    Transformation,
    Other,
}

/// Unified error type for Relay Gateway.
///
/// Kinds mirror the taxonomy in spec §7: client (4xx, not retryable),
/// upstream (5xx from origin), network, circuit-open (never retried),
/// timeout (categorized by origin), transformation (recovered locally),
/// and internal (500, logged at error).
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Upstream not found: {0}")]
    UpstreamNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Plugin error: {0}")]
    PluginError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Auth failed: {0}")]
    AuthFailed(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("IP denied: {0}")]
    IpDenied(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),

    /// Upstream returned a 5xx, or the response is otherwise malformed.
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    /// No healthy/available upstream, or load balancer returned none.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Network-layer failure talking to an upstream (connect/reset/unreachable).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Circuit breaker short-circuited the call before any I/O.
    #[error("Circuit open for upstream {0}")]
    CircuitOpen(String),

    /// A deadline (connection/request/upstream/plugin) was exceeded.
    #[error("Timeout ({origin}) after {elapsed_ms}ms")]
    Timeout {
        origin: TimeoutOrigin,
        elapsed_ms: u64,
    },

    /// Malformed body or unsupported transform; the original body is used.
    #[error("Transformation error: {0}")]
    TransformationError(String),

    /// Request exceeded the configured max body/header size.
    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl RelayError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::RouteNotFound(_) => 404,
            RelayError::UpstreamNotFound(_) => 502,
            RelayError::ServiceNotFound(_) => 503,
            RelayError::ConsumerNotFound(_) => 401,
            RelayError::AuthFailed(_) => 401,
            RelayError::RateLimited => 429,
            RelayError::IpDenied(_) => 403,
            RelayError::PluginError(_) => 500,
            RelayError::BadGateway(_) => 502,
            RelayError::ServiceUnavailable(_) => 503,
            RelayError::NetworkError(_) => 502,
            RelayError::CircuitOpen(_) => 503,
            RelayError::Timeout { origin, .. } => match origin {
                TimeoutOrigin::Upstream | TimeoutOrigin::Connection => 504,
                TimeoutOrigin::Request | TimeoutOrigin::Plugin => 408,
            },
            RelayError::TransformationError(_) => 200, // recovered locally, never surfaced
            RelayError::PayloadTooLarge => 413,
            RelayError::BadRequest(_) => 400,
            _ => 500,
        }
    }

    /// Error code used in the JSON envelope's `error.code` field.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            RelayError::UpstreamNotFound(_) => "UPSTREAM_NOT_FOUND",
            RelayError::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            RelayError::ConsumerNotFound(_) => "CONSUMER_NOT_FOUND",
            RelayError::PluginError(_) => "PLUGIN_ERROR",
            RelayError::ConfigError(_) => "CONFIG_ERROR",
            RelayError::AuthFailed(_) => "AUTH_FAILED",
            RelayError::RateLimited => "RATE_LIMITED",
            RelayError::IpDenied(_) => "IP_DENIED",
            RelayError::StoreError(_) => "STORE_ERROR",
            RelayError::Io(_) => "IO_ERROR",
            RelayError::Serde(_) => "SERDE_ERROR",
            RelayError::Internal(_) => "INTERNAL",
            RelayError::BadGateway(_) => "BAD_GATEWAY",
            RelayError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            RelayError::NetworkError(_) => "NETWORK_ERROR",
            RelayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            RelayError::Timeout { .. } => "TIMEOUT",
            RelayError::TransformationError(_) => "TRANSFORMATION_ERROR",
            RelayError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            RelayError::BadRequest(_) => "BAD_REQUEST",
        }
    }

    /// Error category for metrics rollups (spec §4.15/§7).
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::RouteNotFound(_)
            | RelayError::AuthFailed(_)
            | RelayError::RateLimited
            | RelayError::IpDenied(_)
            | RelayError::PayloadTooLarge
            | RelayError::BadRequest(_) => ErrorCategory::Client,
            RelayError::BadGateway(_) | RelayError::ServiceUnavailable(_) => ErrorCategory::Server,
            RelayError::NetworkError(_) => ErrorCategory::Network,
            RelayError::CircuitOpen(_) => ErrorCategory::CircuitBreaker,
            RelayError::Timeout { .. } => ErrorCategory::Timeout,
            RelayError::TransformationError(_) => ErrorCategory::Transformation,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether a retry manager may attempt this error again, per spec §4.7/§7.
    /// Circuit-open and client errors are never retryable; network/upstream
    /// errors are retryable (the retry manager additionally gates on the
    /// request method and the retryable-status set).
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            RelayError::BadGateway(_)
                | RelayError::ServiceUnavailable(_)
                | RelayError::NetworkError(_)
                | RelayError::Timeout {
                    origin: TimeoutOrigin::Connection | TimeoutOrigin::Upstream,
                    ..
                }
        )
    }

    /// JSON error envelope: `{"error":{"code","message","statusCode","requestId","retryable"}}`.
    /// `retryable` is only emitted outside production, per spec §7.
    /// When `redact_pii` is true, emails/phones/IPv4 literals in the message
    /// are scrubbed before being written to the response body.
    pub fn to_envelope(&self, request_id: &str, production: bool, redact_pii: bool) -> Vec<u8> {
        let message = if redact_pii {
            redact(&self.to_string())
        } else {
            self.to_string()
        };
        let mut obj = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": message,
                "statusCode": self.status_code(),
                "requestId": request_id,
            }
        });
        if !production {
            obj["error"]["retryable"] = serde_json::Value::Bool(self.retryable());
        }
        serde_json::to_vec(&obj).unwrap_or_else(|_| b"{\"error\":{\"code\":\"INTERNAL\"}}".to_vec())
    }

    /// Legacy flat JSON error body (kept for the admin API / existing callers).
    pub fn to_json_body(&self) -> Vec<u8> {
        let status = self.status_code();
        let msg = self.to_string();
        format!(r#"{{"error":"{}","status":{}}}"#, msg, status).into_bytes()
    }
}
