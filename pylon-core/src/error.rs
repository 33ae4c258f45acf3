use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

/// Unified error taxonomy for Pylon.
///
/// Every variant maps to a stable machine-readable code, an HTTP status,
/// and a retryability flag. The mapping is part of the wire contract and
/// must not change between releases.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Request body malformed: {0}")]
    BodyMalformed(String),

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Request body read timed out after {ms}ms")]
    BodyTimeout { ms: u64 },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: f64 },

    #[error("Plugin '{plugin}' failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("Plugin '{plugin}' timed out after {ms}ms in {hook}")]
    PluginTimeout {
        plugin: String,
        hook: String,
        ms: u64,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Circuit open for upstream '{upstream}'")]
    CircuitOpen { upstream: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {ms}ms")]
    RequestTimeout { ms: u64 },

    #[error("Upstream attempt timed out after {ms}ms")]
    UpstreamTimeout { ms: u64 },

    #[error("Connection wait timed out after {ms}ms")]
    ConnectionTimeout { ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable error code for the response envelope and `X-Error-Code`.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::BodyMalformed(_) => "BODY_MALFORMED",
            GatewayError::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            GatewayError::BodyTimeout { .. } => "BODY_TIMEOUT",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::Plugin { .. } => "PLUGIN_ERROR",
            GatewayError::PluginTimeout { .. } => "PLUGIN_TIMEOUT",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::Connection(_) => "CONNECTION_ERROR",
            GatewayError::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            GatewayError::Io(_) => "IO_ERROR",
            GatewayError::Serde(_) => "SERIALIZATION_ERROR",
            GatewayError::Internal(_) => "GATEWAY_ERROR",
        }
    }

    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::BodyMalformed(_) => 400,
            GatewayError::BodyTooLarge { .. } => 413,
            GatewayError::BodyTimeout { .. } => 408,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Plugin { .. } => 500,
            GatewayError::PluginTimeout { .. } => 504,
            GatewayError::Upstream(_) => 502,
            GatewayError::CircuitOpen { .. } => 503,
            GatewayError::Connection(_) => 503,
            GatewayError::RequestTimeout { .. } => 504,
            GatewayError::UpstreamTimeout { .. } => 504,
            GatewayError::ConnectionTimeout { .. } => 504,
            GatewayError::Io(_) => 500,
            GatewayError::Serde(_) => 500,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Whether a retry of the same request may succeed.
    ///
    /// Plugin timeouts are deliberately non-retryable: a hung hook will
    /// hang again, and retrying doubles the damage.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::Upstream(_)
                | GatewayError::Connection(_)
                | GatewayError::RequestTimeout { .. }
                | GatewayError::UpstreamTimeout { .. }
                | GatewayError::ConnectionTimeout { .. }
        )
    }

    /// `Retry-After` value in whole seconds, where the error implies one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => {
                Some(retry_after_secs.ceil().max(1.0) as u64)
            }
            _ => None,
        }
    }

    /// Build the JSON response envelope for this error.
    pub fn to_envelope(
        &self,
        request_id: Option<&str>,
        details: Option<serde_json::Value>,
    ) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
                status_code: self.status_code(),
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                request_id: request_id.map(str::to_string),
                retryable: self.retryable(),
                details,
            },
        }
    }
}

/// Wire-level error envelope: `{"error": {...}}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub status_code: u16,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    pub fn to_json_body(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"error":{"code":"GATEWAY_ERROR","message":"serialization failure","statusCode":500,"retryable":false}}"#.to_vec()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::Validation("x".into()).status_code(), 400);
        assert_eq!(GatewayError::BodyMalformed("x".into()).status_code(), 400);
        assert_eq!(GatewayError::BodyTooLarge { limit: 1 }.status_code(), 413);
        assert_eq!(GatewayError::BodyTimeout { ms: 1 }.status_code(), 408);
        assert_eq!(
            GatewayError::RateLimited {
                retry_after_secs: 1.0
            }
            .status_code(),
            429
        );
        assert_eq!(
            GatewayError::Plugin {
                plugin: "p".into(),
                message: "m".into()
            }
            .status_code(),
            500
        );
        assert_eq!(GatewayError::Upstream("x".into()).status_code(), 502);
        assert_eq!(
            GatewayError::CircuitOpen {
                upstream: "u1".into()
            }
            .status_code(),
            503
        );
        assert_eq!(GatewayError::Connection("refused".into()).status_code(), 503);
        assert_eq!(GatewayError::RequestTimeout { ms: 1 }.status_code(), 504);
        assert_eq!(GatewayError::UpstreamTimeout { ms: 1 }.status_code(), 504);
        assert_eq!(GatewayError::ConnectionTimeout { ms: 1 }.status_code(), 504);
        assert_eq!(
            GatewayError::PluginTimeout {
                plugin: "p".into(),
                hook: "pre_handler".into(),
                ms: 1
            }
            .status_code(),
            504
        );
        assert_eq!(GatewayError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_retryable_matrix() {
        assert!(
            GatewayError::RateLimited {
                retry_after_secs: 1.0
            }
            .retryable()
        );
        assert!(GatewayError::Upstream("x".into()).retryable());
        assert!(GatewayError::Connection("x".into()).retryable());
        assert!(GatewayError::RequestTimeout { ms: 1 }.retryable());
        assert!(GatewayError::UpstreamTimeout { ms: 1 }.retryable());
        assert!(GatewayError::ConnectionTimeout { ms: 1 }.retryable());

        assert!(!GatewayError::Validation("x".into()).retryable());
        assert!(
            !GatewayError::CircuitOpen {
                upstream: "u".into()
            }
            .retryable()
        );
        // Plugin timeouts are the one timeout kind that must not retry.
        assert!(
            !GatewayError::PluginTimeout {
                plugin: "p".into(),
                hook: "pre_route".into(),
                ms: 5
            }
            .retryable()
        );
    }

    #[test]
    fn test_envelope_shape() {
        let err = GatewayError::Upstream("backend returned 500".into());
        let env = err.to_envelope(Some("req-123"), None);
        let parsed: serde_json::Value =
            serde_json::from_slice(&env.to_json_body()).expect("envelope must be valid JSON");
        assert_eq!(parsed["error"]["code"], "UPSTREAM_ERROR");
        assert_eq!(parsed["error"]["statusCode"], 502);
        assert_eq!(parsed["error"]["requestId"], "req-123");
        assert_eq!(parsed["error"]["retryable"], true);
        assert!(parsed["error"]["timestamp"].as_str().is_some());
        assert!(parsed["error"].get("details").is_none());
    }

    #[test]
    fn test_envelope_details_passthrough() {
        let err = GatewayError::Validation("port out of range".into());
        let env = err.to_envelope(None, Some(serde_json::json!({"field": "server.port"})));
        let parsed: serde_json::Value = serde_json::from_slice(&env.to_json_body()).unwrap();
        assert_eq!(parsed["error"]["details"]["field"], "server.port");
        assert!(parsed["error"].get("requestId").is_none());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let err = GatewayError::RateLimited {
            retry_after_secs: 0.2,
        };
        assert_eq!(err.retry_after_secs(), Some(1));
        let err = GatewayError::RateLimited {
            retry_after_secs: 2.1,
        };
        assert_eq!(err.retry_after_secs(), Some(3));
        assert_eq!(GatewayError::Internal("x".into()).retry_after_secs(), None);
    }

    #[test]
    fn test_stable_codes() {
        assert_eq!(
            GatewayError::CircuitOpen {
                upstream: "u".into()
            }
            .code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(
            GatewayError::RateLimited {
                retry_after_secs: 0.0
            }
            .code(),
            "RATE_LIMITED"
        );
        assert_eq!(GatewayError::Internal("x".into()).code(), "GATEWAY_ERROR");
    }
}
