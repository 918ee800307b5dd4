//! Compliance audit log entry.
//!
//! Provides the structured, tamper-evident audit trail required by:
//!
//! | Standard              | Control                                              |
//! |-----------------------|------------------------------------------------------|
//! | HIPAA                 | 164.312(b) – Audit Controls                          |
//! | SOC2 Type II          | CC6.1 Logical Access / CC7.2 Incident Monitoring     |
//! | ISO/IEC 27001:2022    | A.8.15 – Logging / A.8.16 – Monitoring               |
//! | GDPR                  | Art. 30 – Records of Processing Activities           |
//!
//! Every field is serialisable to JSON so records can be shipped to any
//! SIEM (Splunk, Elastic, VictoriaLogs, Datadog, …).

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────

/// Whether the gateway allowed or denied the transaction.
///
/// Serialised as `"ALLOW"` / `"DENY"` for easy SIEM filtering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOutcome {
    /// Request was forwarded to the upstream service.
    Allow,
    /// Request was rejected by a policy (auth, rate-limit, IP block, …).
    Deny,
}

/// A single compliance audit record, written once per HTTP transaction.
///
/// Instances are normally created via [`AuditLogEntry::new`] and then filled
/// in by the proxy worker before being serialised to JSON.
///
/// # PII / PHI notice
/// The fields `client_ip` and `uri` may contain personal data.  Callers
/// **must** run them through the PII scrubber
/// (`relay_observability::pii_scrubber`) before constructing this struct when
/// `compliance.pii_scrubbing.{anonymize_ips,scrub_headers}` are enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    // ── Identity ─────────────────────────────────────────────────
    /// ISO-8601 UTC timestamp (RFC 3339).
    pub timestamp: String,
    /// Unique request identifier, propagated as `X-Request-Id`.
    /// Ties together access-log, audit-log, and distributed traces.
    pub request_id: String,
    /// Authenticated consumer identifier (username / client-id).
    /// `None` when the route has no authentication plugin.
    pub consumer_id: Option<String>,
    /// Distributed trace identifier supplied by the upstream or set by the
    /// gateway (value of `X-Trace-Id` / `traceparent`).
    pub trace_id: Option<String>,

    // ── Request ───────────────────────────────────────────────────
    /// Route identifier matched by the router.
    pub route_id: String,
    /// HTTP method (uppercase: `GET`, `POST`, …).
    pub method: String,
    /// Request URI path + query string.
    /// Query-parameter values matching `pii_scrubbing.uri_redact_patterns`
    /// are replaced with `[REDACTED]`.
    pub uri: String,

    // ── Response ──────────────────────────────────────────────────
    /// HTTP response status code returned to the client.
    pub response_status: u16,
    /// End-to-end latency in milliseconds (request received → response sent).
    pub duration_ms: f64,

    // ── Outcome & policy ─────────────────────────────────────────
    /// Whether the request was allowed or denied by the plugin pipeline.
    pub outcome: AuditOutcome,
    /// Name of the plugin that issued the deny decision.
    /// `None` when `outcome = Allow`.
    pub deny_plugin: Option<String>,
    /// Human-readable reason for a deny decision
    /// (e.g. `"rate limit exceeded"`, `"invalid JWT"`, `"IP blocked"`).
    pub deny_reason: Option<String>,

    // ── Network ───────────────────────────────────────────────────
    /// Client IP address.
    /// When `compliance.pii_scrubbing.anonymize_ips = true` this is
    /// pseudonymised: `192.168.1.42` → `192.168.1.0`.
    pub client_ip: String,

    // ── Data-integrity ────────────────────────────────────────────
    /// `true` when at least one field in this record was scrubbed or
    /// anonymised by the PII scrubber.
    pub pii_scrubbed: bool,
    /// SHA-256 hex digest of the raw request body.
    /// Populated only when `compliance.audit_log.include_request_body_hash = true`.
    /// Provides HIPAA integrity control and non-repudiation evidence.
    pub request_body_hash: Option<String>,
}

impl AuditLogEntry {
    /// Create a minimal entry with only the route ID; fill remaining fields
    /// before serialising.
    pub fn new(route_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            request_id: String::new(),
            consumer_id: None,
            trace_id: None,
            route_id: route_id.into(),
            method: String::new(),
            uri: String::new(),
            response_status: 0,
            duration_ms: 0.0,
            outcome: AuditOutcome::Allow,
            deny_plugin: None,
            deny_reason: None,
            client_ip: String::new(),
            pii_scrubbed: false,
            request_body_hash: None,
        }
    }

    /// Convenience: mark the entry as denied.
    pub fn deny(&mut self, plugin: impl Into<String>, reason: impl Into<String>) {
        self.outcome = AuditOutcome::Deny;
        self.deny_plugin = Some(plugin.into());
        self.deny_reason = Some(reason.into());
    }

    /// Serialise to a compact JSON line suitable for log shipping.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────
