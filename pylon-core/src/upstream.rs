use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A backend origin: one `(protocol, host, port)` plus dispatch metadata.
///
/// Runtime health and circuit state are not stored here. The health
/// checker and circuit breaker own those, and readers mirror what they
/// need (one-way data flow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    /// Unique upstream identifier (`[A-Za-z0-9_-]+`)
    pub id: String,

    #[serde(default)]
    pub protocol: Protocol,

    pub host: String,

    pub port: u16,

    /// Prefix prepended to every forwarded path.
    #[serde(default)]
    pub base_path: String,

    /// Relative selection weight for weighted strategies.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Maximum pooled connections to this upstream.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// TCP connect timeout (milliseconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Single-attempt request timeout (milliseconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Retries on retryable upstream failure.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Health check configuration.
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Labels (metadata).
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Probe style: active HTTP GET, passive traffic observation, or
    /// hybrid (active with passive fallback on probe error).
    #[serde(default)]
    pub mode: HealthCheckMode,

    /// Probe interval (milliseconds, >= 1000).
    #[serde(default = "default_hc_interval")]
    pub interval_ms: u64,

    /// Per-probe timeout (milliseconds, >= 100).
    #[serde(default = "default_hc_timeout")]
    pub timeout_ms: u64,

    /// Path probed by active checks.
    #[serde(default = "default_hc_path")]
    pub path: String,

    /// Expected status for a healthy active probe (100–599).
    #[serde(default = "default_hc_status")]
    pub expected_status: u16,

    /// Consecutive successes required to flip unhealthy -> healthy.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failures required to flip healthy -> unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Freshly added upstreams stay healthy for this long regardless of
    /// probe outcomes (milliseconds).
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    #[default]
    Active,
    Passive,
    Hybrid,
}

fn default_weight() -> u32 {
    1
}
fn default_pool_size() -> usize {
    32
}
fn default_connect_timeout() -> u64 {
    3_000
}
fn default_request_timeout() -> u64 {
    15_000
}
fn default_retries() -> u32 {
    1
}
fn default_hc_interval() -> u64 {
    5_000
}
fn default_hc_timeout() -> u64 {
    2_000
}
fn default_hc_path() -> String {
    "/health".to_string()
}
fn default_hc_status() -> u16 {
    200
}
fn default_healthy_threshold() -> u32 {
    2
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_grace_period() -> u64 {
    10_000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: HealthCheckMode::Active,
            interval_ms: default_hc_interval(),
            timeout_ms: default_hc_timeout(),
            path: default_hc_path(),
            expected_status: default_hc_status(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            grace_period_ms: default_grace_period(),
        }
    }
}

impl Upstream {
    /// `host:port` form used as the connection pool key.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Origin URL used by the active health checker.
    pub fn probe_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol.as_str(),
            self.host,
            self.port,
            self.health_check.path
        )
    }
}
