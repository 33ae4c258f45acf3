//! PII scrubbing for error messages, access logs, and audit records.
//!
//! Two surfaces:
//!   - [`scrub_header`] / [`scrub_headers`]: mask credential-bearing
//!     header values before they reach any log sink.
//!   - [`PiiScrubber::scrub_text`]: redact identifier patterns (emails,
//!     phone numbers, card numbers, SSNs, IPs, bearer credentials) from
//!     free-form text such as error messages in production responses.

use regex::Regex;
use std::net::IpAddr;

/// Replacement string used for all masked values.
pub const REDACTED: &str = "[REDACTED]";

/// Headers that are always masked, regardless of configuration.
pub const ALWAYS_SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "x-access-token",
    "proxy-authorization",
];

/// Mask a single header value if the header name is sensitive.
///
/// Returns `(masked_value, was_scrubbed)`. Sensitivity is membership in
/// [`ALWAYS_SENSITIVE_HEADERS`] or the caller-supplied `extra` list,
/// case-insensitively.
pub fn scrub_header(name: &str, value: &str, extra: &[String]) -> (String, bool) {
    let lower = name.to_lowercase();
    let sensitive = ALWAYS_SENSITIVE_HEADERS.contains(&lower.as_str())
        || extra.iter().any(|e| e.to_lowercase() == lower);
    if sensitive {
        (REDACTED.to_string(), true)
    } else {
        (value.to_string(), false)
    }
}

/// Scrub a header list in place. Returns the number masked.
pub fn scrub_headers(headers: &mut [(String, String)], extra: &[String]) -> usize {
    let mut count = 0;
    for (name, value) in headers.iter_mut() {
        let (new_val, scrubbed) = scrub_header(name, value, extra);
        if scrubbed {
            *value = new_val;
            count += 1;
        }
    }
    count
}

/// Pseudonymise an IP address by zeroing host bits (/24 for IPv4,
/// /48 for IPv6). Non-address input is returned unchanged.
pub fn anonymize_ip(addr: &str) -> String {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("{}.{}.{}.0", o[0], o[1], o[2])
        }
        Ok(IpAddr::V6(v6)) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}::", s[0], s[1], s[2])
        }
        Err(_) => addr.to_string(),
    }
}

/// Compiled redaction patterns for free-form text.
pub struct PiiScrubber {
    patterns: Vec<Regex>,
}

impl PiiScrubber {
    pub fn new() -> Self {
        // Order matters: credentials first so a token containing digits
        // is not half-eaten by the number patterns.
        let raw = [
            // Bearer / Basic credentials
            r"(?i)\b(?:bearer|basic)\s+[A-Za-z0-9\-._~+/=]+",
            // Email addresses
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            // Credit-card-shaped digit runs (13-19 digits, optional separators)
            r"\b(?:\d[- ]?){13,19}\b",
            // US SSN
            r"\b\d{3}-\d{2}-\d{4}\b",
            // Phone numbers (international-ish)
            r"\+?\d{1,3}[-. ]?\(?\d{2,4}\)?[-. ]?\d{3,4}[-. ]?\d{3,4}",
            // IPv4 literals
            r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
        ];
        let patterns = raw
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self { patterns }
    }

    /// Replace every identifier-shaped substring with [`REDACTED`].
    pub fn scrub_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.patterns {
            out = re.replace_all(&out, REDACTED).into_owned();
        }
        out
    }
}

impl Default for PiiScrubber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_headers_masked() {
        let (v, scrubbed) = scrub_header("Authorization", "Bearer abc123", &[]);
        assert_eq!(v, REDACTED);
        assert!(scrubbed);

        let (v, scrubbed) = scrub_header("Content-Type", "application/json", &[]);
        assert_eq!(v, "application/json");
        assert!(!scrubbed);
    }

    #[test]
    fn test_extra_headers_masked() {
        let extra = vec!["X-Tenant-Secret".to_string()];
        let (v, scrubbed) = scrub_header("x-tenant-secret", "s3cr3t", &extra);
        assert_eq!(v, REDACTED);
        assert!(scrubbed);
    }

    #[test]
    fn test_scrub_headers_in_place() {
        let mut headers = vec![
            ("cookie".to_string(), "session=abc".to_string()),
            ("accept".to_string(), "*/*".to_string()),
        ];
        let count = scrub_headers(&mut headers, &[]);
        assert_eq!(count, 1);
        assert_eq!(headers[0].1, REDACTED);
        assert_eq!(headers[1].1, "*/*");
    }

    #[test]
    fn test_anonymize_ip() {
        assert_eq!(anonymize_ip("192.168.1.42"), "192.168.1.0");
        assert_eq!(anonymize_ip("2001:db8:85a3::8a2e:370:7334"), "2001:db8:85a3::");
        assert_eq!(anonymize_ip("not-an-ip"), "not-an-ip");
    }

    #[test]
    fn test_scrub_text_patterns() {
        let scrubber = PiiScrubber::new();

        let cases = [
            ("contact alice@example.com now", "alice@example.com"),
            ("card 4111 1111 1111 1111 declined", "4111 1111 1111 1111"),
            ("ssn 123-45-6789 on file", "123-45-6789"),
            ("from 10.1.2.3 refused", "10.1.2.3"),
            ("header was Bearer eyJhbGciOi.payload", "Bearer eyJhbGciOi"),
            ("auth Basic dXNlcjpwYXNz failed", "Basic dXNlcjpwYXNz"),
        ];
        for (input, secret) in cases {
            let out = scrubber.scrub_text(input);
            assert!(
                !out.contains(secret),
                "{:?} leaked through as {:?}",
                secret,
                out
            );
            assert!(out.contains(REDACTED), "no redaction in {:?}", out);
        }
    }

    #[test]
    fn test_scrub_text_leaves_clean_text_alone() {
        let scrubber = PiiScrubber::new();
        let msg = "upstream returned unexpected status";
        assert_eq!(scrubber.scrub_text(msg), msg);
    }
}
