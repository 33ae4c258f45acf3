use crate::error::GatewayError;
use crate::route::Route;
use crate::upstream::Upstream;
use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Config schema version this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: &str = "2.0";

/// Top-level configuration for the Pylon gateway.
///
/// Loaded from a JSON document merged with `PYLON_`-prefixed environment
/// variables (`PYLON_SERVER__PORT=8081` style). Documents with a `1.x`
/// version are migrated before deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Semver schema version of the document.
    pub version: String,

    pub environment: Environment,

    pub server: ServerConfig,

    pub routes: Vec<Route>,

    pub upstreams: Vec<Upstream>,

    pub plugins: Vec<PluginEntry>,

    pub performance: PerformanceConfig,

    pub cache: CacheSettings,

    pub balancer: BalancerSettings,

    pub circuit_breaker: BreakerSettings,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener port (1–65535).
    pub port: u16,

    pub host: String,

    /// HTTP/1.1 keep-alive toggle.
    pub keep_alive: bool,

    /// Idle keep-alive timeout (milliseconds, >= 1000).
    pub keep_alive_timeout_ms: u64,

    /// End-to-end request timeout (milliseconds, >= 100).
    pub request_timeout_ms: u64,

    /// Maximum header block size (bytes, >= 1024).
    pub max_header_size: usize,

    /// Maximum request body size (bytes, >= 1024).
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            keep_alive: true,
            keep_alive_timeout_ms: 65_000,
            request_timeout_ms: 30_000,
            max_header_size: 16 * 1024,
            max_body_size: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One plugin activation with its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Chain position; defaults to registration order.
    #[serde(default)]
    pub order: Option<i64>,

    /// Per-hook execution budget (milliseconds).
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default = "default_settings")]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Worker threads (0 = one per core).
    pub worker_count: usize,

    /// Request contexts pre-allocated per worker (>= 10).
    pub context_pool_size: usize,

    /// Read buffers retained per worker (>= 10).
    pub buffer_pool_size: usize,

    /// Response build buffers retained per worker (>= 10).
    pub response_pool_size: usize,

    pub enable_pooling: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            context_pool_size: 1_000,
            buffer_pool_size: 256,
            response_pool_size: 256,
            enable_pooling: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: usize,
    pub max_size_bytes: usize,
    pub default_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            max_size_bytes: 64 * 1024 * 1024,
            default_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSettings {
    /// Strategy name: round_robin, least_connections,
    /// weighted_round_robin, ip_hash, random.
    pub strategy: String,

    /// Skip unhealthy upstreams during selection.
    pub health_aware: bool,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            strategy: "round_robin".to_string(),
            health_aware: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures within a full window that trip the circuit.
    pub failure_threshold: u32,

    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,

    /// Outcomes kept in the sliding window.
    pub window_size: usize,

    /// How long an open circuit rejects before probing (milliseconds).
    pub open_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            window_size: 10,
            open_timeout_ms: 30_000,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: CURRENT_SCHEMA_VERSION.to_string(),
            environment: Environment::default(),
            server: ServerConfig::default(),
            routes: Vec::new(),
            upstreams: Vec::new(),
            plugins: Vec::new(),
            performance: PerformanceConfig::default(),
            cache: CacheSettings::default(),
            balancer: BalancerSettings::default(),
            circuit_breaker: BreakerSettings::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_settings() -> serde_json::Value {
    serde_json::json!({})
}

impl GatewayConfig {
    /// Load configuration: JSON file (migrated if needed) merged with
    /// `PYLON_`-prefixed environment variables.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));

        if let Some(path) = config_path {
            let raw = std::fs::read_to_string(path)?;
            let doc: serde_json::Value = serde_json::from_str(&raw)?;
            let doc = migrate(doc)?;
            figment = figment.merge(Serialized::defaults(doc));
        }

        figment = figment.merge(Env::prefixed("PYLON_").split("__"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved worker count (0 = one per core).
    pub fn effective_workers(&self) -> usize {
        if self.performance.worker_count > 0 {
            return self.performance.worker_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Enforce every documented range. Returns the first violation.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let major = self
            .version
            .split('.')
            .next()
            .and_then(|m| m.parse::<u64>().ok())
            .ok_or_else(|| invalid(format!("version '{}' is not semver", self.version)))?;
        if major != 2 {
            return Err(invalid(format!(
                "unsupported config version '{}' (expected 2.x)",
                self.version
            )));
        }

        if self.server.port == 0 {
            return Err(invalid("server.port must be in 1–65535"));
        }
        if self.server.keep_alive_timeout_ms < 1_000 {
            return Err(invalid("server.keep_alive_timeout_ms must be >= 1000"));
        }
        if self.server.request_timeout_ms < 100 {
            return Err(invalid("server.request_timeout_ms must be >= 100"));
        }
        if self.server.max_header_size < 1_024 {
            return Err(invalid("server.max_header_size must be >= 1024"));
        }
        if self.server.max_body_size < 1_024 {
            return Err(invalid("server.max_body_size must be >= 1024"));
        }

        if self.performance.context_pool_size < 10 {
            return Err(invalid("performance.context_pool_size must be >= 10"));
        }
        if self.performance.buffer_pool_size < 10 {
            return Err(invalid("performance.buffer_pool_size must be >= 10"));
        }
        if self.performance.response_pool_size < 10 {
            return Err(invalid("performance.response_pool_size must be >= 10"));
        }

        let id_pattern =
            regex::Regex::new(r"^[A-Za-z0-9_-]+$").map_err(|e| invalid(e.to_string()))?;
        let mut seen = HashSet::new();
        for up in &self.upstreams {
            if !id_pattern.is_match(&up.id) {
                return Err(invalid(format!(
                    "upstream id '{}' must match [A-Za-z0-9_-]+",
                    up.id
                )));
            }
            if !seen.insert(up.id.as_str()) {
                return Err(invalid(format!("duplicate upstream id '{}'", up.id)));
            }
            if up.port == 0 {
                return Err(invalid(format!("upstream '{}': port must be 1–65535", up.id)));
            }
            if up.pool_size < 1 {
                return Err(invalid(format!("upstream '{}': pool_size must be >= 1", up.id)));
            }
            if up.connect_timeout_ms < 100 || up.request_timeout_ms < 100 {
                return Err(invalid(format!("upstream '{}': timeouts must be >= 100", up.id)));
            }
            let hc = &up.health_check;
            if hc.enabled {
                if hc.interval_ms < 1_000 {
                    return Err(invalid(format!(
                        "upstream '{}': health_check.interval_ms must be >= 1000",
                        up.id
                    )));
                }
                if hc.timeout_ms < 100 {
                    return Err(invalid(format!(
                        "upstream '{}': health_check.timeout_ms must be >= 100",
                        up.id
                    )));
                }
                if !(100..=599).contains(&hc.expected_status) {
                    return Err(invalid(format!(
                        "upstream '{}': health_check.expected_status must be 100–599",
                        up.id
                    )));
                }
            }
        }

        let mut route_ids = HashSet::new();
        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(invalid(format!(
                    "route '{}': path must start with '/'",
                    route.id
                )));
            }
            if !route_ids.insert(route.id.as_str()) {
                return Err(invalid(format!("duplicate route id '{}'", route.id)));
            }
            if let Some(ref up_id) = route.upstream_id
                && !seen.contains(up_id.as_str())
            {
                return Err(invalid(format!(
                    "route '{}': unknown upstream '{}'",
                    route.id, up_id
                )));
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> GatewayError {
    GatewayError::Validation(msg.into())
}

/// Upgrade older config documents to the current schema.
///
/// v1 documents (the original gateway) used camelCase keys; v2 uses
/// snake_case. Unknown future majors are refused rather than guessed at.
pub fn migrate(mut doc: serde_json::Value) -> Result<serde_json::Value, GatewayError> {
    let version = doc
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or(CURRENT_SCHEMA_VERSION)
        .to_string();
    let major = version
        .split('.')
        .next()
        .and_then(|m| m.parse::<u64>().ok())
        .ok_or_else(|| invalid(format!("version '{}' is not semver", version)))?;

    match major {
        2 => Ok(doc),
        1 => {
            if let Some(server) = doc.get_mut("server").and_then(|s| s.as_object_mut()) {
                rename_key(server, "keepAlive", "keep_alive");
                rename_key(server, "keepAliveTimeout", "keep_alive_timeout_ms");
                rename_key(server, "requestTimeout", "request_timeout_ms");
                rename_key(server, "maxHeaderSize", "max_header_size");
                rename_key(server, "maxBodySize", "max_body_size");
            }
            if let Some(perf) = doc.get_mut("performance").and_then(|s| s.as_object_mut()) {
                rename_key(perf, "workerCount", "worker_count");
                rename_key(perf, "contextPoolSize", "context_pool_size");
                rename_key(perf, "bufferPoolSize", "buffer_pool_size");
                rename_key(perf, "responsePoolSize", "response_pool_size");
                rename_key(perf, "enablePooling", "enable_pooling");
            }
            if let Some(upstreams) = doc.get_mut("upstreams").and_then(|s| s.as_array_mut()) {
                for up in upstreams {
                    if let Some(up) = up.as_object_mut() {
                        rename_key(up, "basePath", "base_path");
                        rename_key(up, "poolSize", "pool_size");
                        rename_key(up, "timeout", "request_timeout_ms");
                        rename_key(up, "healthCheck", "health_check");
                        if let Some(hc) =
                            up.get_mut("health_check").and_then(|h| h.as_object_mut())
                        {
                            rename_key(hc, "interval", "interval_ms");
                            rename_key(hc, "timeout", "timeout_ms");
                            rename_key(hc, "expectedStatus", "expected_status");
                        }
                    }
                }
            }
            doc["version"] = serde_json::json!(CURRENT_SCHEMA_VERSION);
            Ok(doc)
        }
        other => Err(invalid(format!(
            "cannot migrate config version {}.x (supported: 1.x, 2.x)",
            other
        ))),
    }
}

fn rename_key(obj: &mut serde_json::Map<String, serde_json::Value>, from: &str, to: &str) {
    if let Some(v) = obj.remove(from) {
        obj.insert(to.to_string(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.version, "2.0");
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.server.keep_alive);
        assert_eq!(cfg.environment, Environment::Development);
        cfg.validate().expect("defaults must validate");
    }

    #[test]
    fn test_port_zero_rejected() {
        let mut cfg = GatewayConfig::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_keep_alive_timeout_floor() {
        let mut cfg = GatewayConfig::default();
        cfg.server.keep_alive_timeout_ms = 999;
        assert!(cfg.validate().is_err());
        cfg.server.keep_alive_timeout_ms = 1_000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_upstream_id_pattern() {
        let mut cfg = GatewayConfig::default();
        cfg.upstreams.push(
            serde_json::from_value(serde_json::json!({
                "id": "bad id!", "host": "h", "port": 80
            }))
            .unwrap(),
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("bad id!"));
    }

    #[test]
    fn test_duplicate_upstream_ids_rejected() {
        let mut cfg = GatewayConfig::default();
        for _ in 0..2 {
            cfg.upstreams.push(
                serde_json::from_value(serde_json::json!({
                    "id": "api", "host": "h", "port": 80
                }))
                .unwrap(),
            );
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_route_referencing_unknown_upstream_rejected() {
        let mut cfg = GatewayConfig::default();
        cfg.routes.push(
            serde_json::from_value(serde_json::json!({
                "id": "r1", "path": "/a", "upstream_id": "missing"
            }))
            .unwrap(),
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_health_check_ranges() {
        let mut cfg = GatewayConfig::default();
        cfg.upstreams.push(
            serde_json::from_value(serde_json::json!({
                "id": "api", "host": "h", "port": 80,
                "health_check": { "enabled": true, "interval_ms": 500 }
            }))
            .unwrap(),
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_migrate_v1_camel_case() {
        let v1 = serde_json::json!({
            "version": "1.3",
            "server": {
                "port": 9090,
                "keepAlive": true,
                "keepAliveTimeout": 30000,
                "requestTimeout": 5000,
                "maxHeaderSize": 8192,
                "maxBodySize": 2048
            },
            "upstreams": [
                { "id": "api", "host": "h", "port": 80, "poolSize": 8,
                  "healthCheck": { "enabled": true, "interval": 5000, "expectedStatus": 204 } }
            ]
        });
        let migrated = migrate(v1).unwrap();
        assert_eq!(migrated["version"], "2.0");
        assert_eq!(migrated["server"]["keep_alive_timeout_ms"], 30000);
        assert_eq!(migrated["server"]["max_body_size"], 2048);
        assert_eq!(migrated["upstreams"][0]["pool_size"], 8);
        assert_eq!(
            migrated["upstreams"][0]["health_check"]["expected_status"],
            204
        );

        let cfg: GatewayConfig = serde_json::from_value(migrated).unwrap();
        assert_eq!(cfg.server.port, 9090);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_migrate_future_major_refused() {
        let v3 = serde_json::json!({ "version": "3.0" });
        assert!(migrate(v3).is_err());
    }

    #[test]
    fn test_migrate_missing_version_assumes_current() {
        let doc = serde_json::json!({ "server": { "port": 81 } });
        let migrated = migrate(doc).unwrap();
        assert_eq!(migrated["server"]["port"], 81);
    }

    #[test]
    fn test_effective_workers_auto() {
        let cfg = GatewayConfig::default();
        assert!(cfg.effective_workers() >= 1);
        let mut cfg = cfg;
        cfg.performance.worker_count = 3;
        assert_eq!(cfg.effective_workers(), 3);
    }

    #[test]
    fn test_plugin_entry_defaults() {
        let p: PluginEntry =
            serde_json::from_value(serde_json::json!({ "name": "request-id" })).unwrap();
        assert!(p.enabled);
        assert!(p.order.is_none());
        assert_eq!(p.settings, serde_json::json!({}));
    }
}
