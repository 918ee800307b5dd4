//! PII / PHI scrubbing utilities for access logs and audit records.
//!
//! Satisfies:
//!
//! | Standard              | Control                                                   |
//! |-----------------------|-----------------------------------------------------------|
//! | HIPAA                 | 164.312(e)(2)(ii) – de-identification / encryption of PHI |
//! | GDPR                  | Art. 32 – pseudonymisation & data minimisation            |
//! | SOC2 Type II          | Confidentiality criteria (CC9.2)                          |
//! | ISO/IEC 27001:2022    | A.8.11 – Data masking                                     |
//!
//! # Usage
//!
//! ```
//! use relay_observability::pii_scrubber::{scrub_header, anonymize_ip, scrub_uri};
//!
//! // Mask a sensitive header
//! let (val, scrubbed) = scrub_header("Authorization", "Bearer eyJ...", &[]);
//! assert_eq!(val, "[REDACTED]");
//! assert!(scrubbed);
//!
//! // Anonymise an IPv4 address (GDPR)
//! assert_eq!(anonymize_ip("192.168.1.42"), "192.168.1.0");
//!
//! // Redact sensitive query-param values using compiled regexes
//! use regex::Regex;
//! let patterns = vec![Regex::new(r"(?i)ssn=[^&]+").unwrap()];
//! let (uri, scrubbed) = scrub_uri("/api/lookup?ssn=123-45-6789&foo=bar", &patterns);
//! assert!(scrubbed);
//! assert!(!uri.contains("123-45-6789"));
//! ```

use regex::Regex;
use std::net::IpAddr;

/// Replacement string used for all masked values.
pub const REDACTED: &str = "[REDACTED]";

/// Headers that are **always** masked, regardless of configuration.
///
/// These carry credentials, session tokens, or topology information and must
/// never appear in plaintext logs.
pub const ALWAYS_SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "x-access-token",
    "proxy-authorization",
    "www-authenticate", // may echo challenge with realm/nonce details
];

// ─────────────────────────────────────────────────────────────
// Header scrubbing
// ─────────────────────────────────────────────────────────────

/// Mask a single header value if the header name is considered sensitive.
///
/// Returns `(masked_value, was_scrubbed)`.
///
/// Sensitivity is determined by:
/// 1. Membership in [`ALWAYS_SENSITIVE_HEADERS`] (case-insensitive).
/// 2. Membership in the caller-supplied `extra` list (case-insensitive).
///
/// # Arguments
/// * `name`  – HTTP header name (e.g. `"Authorization"`).
/// * `value` – Raw header value as seen in the request.
/// * `extra` – Additional header names configured by the operator.
pub fn scrub_header(name: &str, value: &str, extra: &[String]) -> (String, bool) {
    let lower = name.to_lowercase();
    let is_sensitive = ALWAYS_SENSITIVE_HEADERS.contains(&lower.as_str())
        || extra.iter().any(|e| e.to_lowercase() == lower);

    if is_sensitive {
        (REDACTED.to_string(), true)
    } else {
        (value.to_string(), false)
    }
}

/// Scrub all headers in a mutable map.
///
/// Returns the number of headers that were masked.
///
/// ```
/// use std::collections::HashMap;
/// use relay_observability::pii_scrubber::scrub_headers_map;
///
/// let mut headers = HashMap::new();
/// headers.insert("authorization".to_string(), "Bearer secret".to_string());
/// headers.insert("content-type".to_string(), "application/json".to_string());
/// let count = scrub_headers_map(&mut headers, &[]);
/// assert_eq!(count, 1);
/// assert_eq!(headers["authorization"], "[REDACTED]");
/// assert_eq!(headers["content-type"], "application/json");
/// ```
pub fn scrub_headers_map(
    headers: &mut std::collections::HashMap<String, String>,
    extra: &[String],
) -> usize {
    let mut count = 0usize;
    for (key, value) in headers.iter_mut() {
        let (new_val, scrubbed) = scrub_header(key, value, extra);
        if scrubbed {
            *value = new_val;
            count += 1;
        }
    }
    count
}

// ─────────────────────────────────────────────────────────────
// IP anonymisation (GDPR Art. 32 pseudonymisation)
// ─────────────────────────────────────────────────────────────

/// Pseudonymise an IP address by zeroing its host-specific bits.
///
/// Technique aligns with the standard approach recognised by EU data-protection
/// authorities for making IP addresses *not directly identifiable*:
///
/// - **IPv4** `a.b.c.d` → `a.b.c.0`   (last octet zeroed)
/// - **IPv6** full address → network prefix with last 64 bits zeroed
///
/// Returns the original string unchanged when it cannot be parsed (already
/// anonymised, hostname, etc.).
pub fn anonymize_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.0")
        }
        Ok(IpAddr::V6(v6)) => {
            let mut segs = v6.segments();
            // Zero the last four 16-bit words (64-bit host part).
            segs[4] = 0;
            segs[5] = 0;
            segs[6] = 0;
            segs[7] = 0;
            std::net::Ipv6Addr::from(segs).to_string()
        }
        Err(_) => ip.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────
// URI / query-param scrubbing
// ─────────────────────────────────────────────────────────────

/// Replace any substrings in `uri` that match a compiled regex with
/// `[REDACTED]`.
///
/// Each pattern should match the part of the URI that contains a sensitive
/// value.  For example, to redact Social Security Numbers in query strings:
///
/// ```text
/// (?i)ssn=[^&]+
/// ```
///
/// Returns `(scrubbed_uri, was_scrubbed)`.
pub fn scrub_uri(uri: &str, patterns: &[Regex]) -> (String, bool) {
    let mut result = uri.to_string();
    let mut scrubbed = false;
    for re in patterns {
        let new = re.replace_all(&result, REDACTED).to_string();
        if new != result {
            scrubbed = true;
            result = new;
        }
    }
    (result, scrubbed)
}

/// Compile a list of regex pattern strings into [`Regex`] objects, ignoring
/// invalid patterns (logs a warning and skips).
pub fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            Regex::new(p)
                .map_err(|e| tracing::warn!("invalid PII redaction pattern {:?}: {}", p, e))
                .ok()
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────
