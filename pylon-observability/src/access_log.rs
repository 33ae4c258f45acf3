use crate::pii::{anonymize_ip, scrub_headers};
use serde::{Deserialize, Serialize};

/// Structured access log entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub request_id: String,
    pub route_id: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: f64,
    pub upstream_id: Option<String>,
    pub cache: Option<&'static str>,
}

/// Emits access log lines through `tracing`, scrubbing sensitive
/// material first when running in production.
pub struct AccessLogger {
    production: bool,
    extra_sensitive_headers: Vec<String>,
}

impl AccessLogger {
    pub fn new(production: bool) -> Self {
        Self {
            production,
            extra_sensitive_headers: Vec::new(),
        }
    }

    pub fn with_extra_sensitive_headers(mut self, headers: Vec<String>) -> Self {
        self.extra_sensitive_headers = headers;
        self
    }

    /// Scrub (in production) and emit one entry.
    pub fn log(&self, mut entry: AccessLogEntry, headers: &mut Vec<(String, String)>) {
        if self.production {
            entry.client_ip = anonymize_ip(&entry.client_ip);
            scrub_headers(headers, &self.extra_sensitive_headers);
        }
        tracing::info!(
            target: "pylon::access",
            request_id = %entry.request_id,
            route_id = %entry.route_id,
            client_ip = %entry.client_ip,
            method = %entry.method,
            path = %entry.path,
            status = entry.status,
            latency_ms = entry.latency_ms,
            upstream = entry.upstream_id.as_deref().unwrap_or("-"),
            cache = entry.cache.unwrap_or("-"),
            "access"
        );
    }
}
