//! Free-text PII redaction for error messages written to response bodies.
//!
//! Scoped narrowly per spec §7: emails, phone numbers, and IPv4 literals.
//! Header/query scrubbing for access logs lives in `relay-observability`'s
//! `pii_scrubber` module, which has a different job (structured fields, not
//! free text) and calls back into [`redact`] so both layers share one
//! definition of what a PII pattern looks like.

use std::sync::LazyLock;

static EMAIL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
});

static PHONE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\+?\d{1,3}[-.\s]?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap()
});

static IPV4_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap()
});

/// Redact emails, phone numbers, and IPv4 literals from free text.
pub fn redact(text: &str) -> String {
    let text = EMAIL_RE.replace_all(text, "[REDACTED_EMAIL]");
    let text = PHONE_RE.replace_all(&text, "[REDACTED_PHONE]");
    let text = IPV4_RE.replace_all(&text, "[REDACTED_IP]");
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_email() {
        assert_eq!(redact("contact alice@example.com please"), "contact [REDACTED_EMAIL] please");
    }

    #[test]
    fn redacts_phone() {
        assert_eq!(redact("call 555-123-4567 now"), "call [REDACTED_PHONE] now");
    }

    #[test]
    fn redacts_ipv4() {
        assert_eq!(redact("upstream 10.0.0.5 unreachable"), "upstream [REDACTED_IP] unreachable");
    }

    #[test]
    fn leaves_clean_text_untouched() {
        assert_eq!(redact("route not found: r1"), "route not found: r1");
    }

    #[test]
    fn redacts_multiple_kinds_in_one_message() {
        let msg = "user bob@corp.io at 192.168.1.1 called 555-000-1111";
        let out = redact(msg);
        assert!(out.contains("[REDACTED_EMAIL]"));
        assert!(out.contains("[REDACTED_IP]"));
        assert!(out.contains("[REDACTED_PHONE]"));
    }
}
