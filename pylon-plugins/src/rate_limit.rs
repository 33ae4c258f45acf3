use async_trait::async_trait;
use pylon_core::context::RequestContext;
use pylon_plugin::plugin::{Hook, HookResult, Plugin, PluginInstance};
use pylon_traffic::token_bucket::{TokenBucketConfig, TokenBucketLimiter};
use regex::Regex;
use serde::Deserialize;
use std::cell::RefCell;

/// Token-bucket rate limiting plugin.
///
/// Limits are worker-local (the limiter table is per worker, like every
/// other piece of hot-path state). For cluster-wide limits put a shared
/// store in front; that is out of scope here.
pub struct RateLimitPlugin;

#[derive(Debug, Deserialize, Clone)]
struct RateLimitConfig {
    /// Bucket capacity (burst size).
    #[serde(default = "default_capacity")]
    capacity: f64,

    /// Tokens replenished per second.
    #[serde(default = "default_refill_rate")]
    refill_rate: f64,

    /// Keys tracked before LRU eviction.
    #[serde(default = "default_max_buckets")]
    max_buckets: usize,

    /// Limit by: "ip" (default), "route", or "header".
    #[serde(default = "default_key_by")]
    key_by: String,

    /// Header supplying the key when `key_by = "header"`.
    #[serde(default)]
    header_name: Option<String>,

    /// Glob patterns (`*` wildcard) selecting the paths to limit.
    /// Empty = every path. Matches are anchored over the full path.
    #[serde(default)]
    routes: Vec<String>,

    /// Status for rejected requests.
    #[serde(default = "default_status")]
    status: u16,

    #[serde(default = "default_message")]
    message: String,
}

fn default_capacity() -> f64 {
    60.0
}
fn default_refill_rate() -> f64 {
    1.0
}
fn default_max_buckets() -> usize {
    100_000
}
fn default_key_by() -> String {
    "ip".to_string()
}
fn default_status() -> u16 {
    429
}
fn default_message() -> String {
    "Rate limit exceeded".to_string()
}

impl Plugin for RateLimitPlugin {
    fn name(&self) -> &str {
        "rate-limit"
    }

    fn check_schema(&self, settings: &serde_json::Value) -> anyhow::Result<()> {
        let cfg: RateLimitConfig = serde_json::from_value(settings.clone())?;
        if cfg.capacity <= 0.0 || cfg.refill_rate <= 0.0 {
            anyhow::bail!("capacity and refill_rate must be positive");
        }
        Ok(())
    }

    fn configure(&self, settings: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let cfg: RateLimitConfig = serde_json::from_value(settings.clone())?;
        let route_patterns = cfg
            .routes
            .iter()
            .map(|glob| compile_glob(glob))
            .collect::<Result<Vec<_>, _>>()?;
        let limiter = TokenBucketLimiter::new(TokenBucketConfig {
            capacity: cfg.capacity,
            refill_rate: cfg.refill_rate,
            max_buckets: cfg.max_buckets,
        });
        Ok(Box::new(RateLimitInstance {
            cfg,
            route_patterns,
            limiter: RefCell::new(limiter),
        }))
    }
}

/// `*` becomes `.*`; everything else is matched literally, anchored over
/// the whole path.
fn compile_glob(glob: &str) -> anyhow::Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Ok(Regex::new(&pattern)?)
}

struct RateLimitInstance {
    cfg: RateLimitConfig,
    route_patterns: Vec<Regex>,
    limiter: RefCell<TokenBucketLimiter>,
}

impl RateLimitInstance {
    fn applies_to(&self, path: &str) -> bool {
        self.route_patterns.is_empty() || self.route_patterns.iter().any(|re| re.is_match(path))
    }

    fn key_for(&self, ctx: &RequestContext) -> String {
        match self.cfg.key_by.as_str() {
            "route" => ctx
                .route
                .as_ref()
                .map(|r| r.id.clone())
                .unwrap_or_else(|| ctx.path.clone()),
            "header" => self
                .cfg
                .header_name
                .as_deref()
                .and_then(|h| ctx.headers.get(h))
                .unwrap_or("anonymous")
                .to_string(),
            _ => ctx.client_ip.clone(),
        }
    }
}

#[async_trait(?Send)]
impl PluginInstance for RateLimitInstance {
    fn name(&self) -> &str {
        "rate-limit"
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::PreHandler]
    }

    async fn pre_handler(&self, ctx: &mut RequestContext) -> HookResult {
        if !self.applies_to(&ctx.path) {
            return HookResult::Continue;
        }

        let key = self.key_for(ctx);
        let decision = self.limiter.borrow_mut().consume(&key, 1.0);

        if decision.allowed {
            ctx.set_response_header("X-RateLimit-Limit", decision.limit.to_string());
            ctx.set_response_header("X-RateLimit-Remaining", decision.remaining.to_string());
            ctx.set_response_header(
                "X-RateLimit-Reset",
                format!("{:.0}", decision.reset_in_secs.ceil()),
            );
            return HookResult::Continue;
        }

        let retry_after = decision.retry_after_secs.unwrap_or(0.0);
        let retry_after_header = retry_after.ceil().max(1.0) as u64;
        tracing::debug!(key = %key, retry_after, "Request rate limited");

        let body = serde_json::json!({
            "error": self.cfg.message,
            "limit": decision.limit,
            "remaining": decision.remaining,
            "resetIn": decision.reset_in_secs,
            "retryAfter": retry_after,
        });

        HookResult::Respond {
            status: self.cfg.status,
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("X-RateLimit-Limit".to_string(), decision.limit.to_string()),
                ("X-RateLimit-Remaining".to_string(), "0".to_string()),
                (
                    "X-RateLimit-Reset".to_string(),
                    format!("{:.0}", decision.reset_in_secs.ceil()),
                ),
                ("Retry-After".to_string(), retry_after_header.to_string()),
            ],
            body: body.to_string().into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rt() -> monoio::Runtime<monoio::LegacyDriver> {
        monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
            .build()
            .expect("monoio runtime build failed")
    }

    fn instance(settings: serde_json::Value) -> Box<dyn PluginInstance> {
        RateLimitPlugin.configure(&settings).unwrap()
    }

    fn ctx(path: &str, ip: &str) -> RequestContext {
        let mut c = RequestContext::default();
        c.begin("GET", path, ip);
        c
    }

    #[test]
    fn test_allows_within_budget_and_sets_headers() {
        make_rt().block_on(async {
            let inst = instance(serde_json::json!({ "capacity": 2, "refill_rate": 1 }));
            let mut c = ctx("/api", "1.1.1.1");
            let r = inst.pre_handler(&mut c).await;
            assert!(matches!(r, HookResult::Continue));
            assert!(
                c.response
                    .headers
                    .iter()
                    .any(|(k, v)| k == "X-RateLimit-Limit" && v == "2")
            );
            assert!(
                c.response
                    .headers
                    .iter()
                    .any(|(k, v)| k == "X-RateLimit-Remaining" && v == "1")
            );
        });
    }

    #[test]
    fn test_deny_produces_429_envelope() {
        make_rt().block_on(async {
            let inst = instance(serde_json::json!({ "capacity": 1, "refill_rate": 0.5 }));
            let mut c = ctx("/api", "1.1.1.1");
            assert!(matches!(inst.pre_handler(&mut c).await, HookResult::Continue));

            let r = inst.pre_handler(&mut c).await;
            let HookResult::Respond {
                status,
                headers,
                body,
            } = r
            else {
                panic!("expected 429 response");
            };
            assert_eq!(status, 429);
            let names: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
            assert!(names.contains(&"X-RateLimit-Limit"));
            assert!(names.contains(&"X-RateLimit-Remaining"));
            assert!(names.contains(&"X-RateLimit-Reset"));
            assert!(names.contains(&"Retry-After"));
            assert!(
                headers
                    .iter()
                    .any(|(k, v)| k == "X-RateLimit-Remaining" && v == "0")
            );

            let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(parsed["limit"], 1);
            assert_eq!(parsed["remaining"], 0);
            assert!(parsed["error"].as_str().is_some());
            assert!(parsed["resetIn"].as_f64().is_some());
            assert!(parsed["retryAfter"].as_f64().is_some());
        });
    }

    #[test]
    fn test_keys_by_ip_independently() {
        make_rt().block_on(async {
            let inst = instance(serde_json::json!({ "capacity": 1, "refill_rate": 0.01 }));
            let mut a = ctx("/api", "1.1.1.1");
            let mut b = ctx("/api", "2.2.2.2");
            assert!(matches!(inst.pre_handler(&mut a).await, HookResult::Continue));
            assert!(matches!(
                inst.pre_handler(&mut a).await,
                HookResult::Respond { .. }
            ));
            assert!(matches!(inst.pre_handler(&mut b).await, HookResult::Continue));
        });
    }

    #[test]
    fn test_route_glob_scoping() {
        make_rt().block_on(async {
            let inst = instance(serde_json::json!({
                "capacity": 1, "refill_rate": 0.01,
                "routes": ["/api/*"]
            }));
            // Unscoped path: never limited.
            let mut free = ctx("/public/page", "1.1.1.1");
            for _ in 0..5 {
                free.responded = false;
                assert!(matches!(
                    inst.pre_handler(&mut free).await,
                    HookResult::Continue
                ));
            }
            // Scoped path: limited after capacity.
            let mut scoped = ctx("/api/users", "1.1.1.1");
            assert!(matches!(
                inst.pre_handler(&mut scoped).await,
                HookResult::Continue
            ));
            assert!(matches!(
                inst.pre_handler(&mut scoped).await,
                HookResult::Respond { .. }
            ));
        });
    }

    #[test]
    fn test_glob_is_anchored() {
        let re = compile_glob("/api/*").unwrap();
        assert!(re.is_match("/api/users"));
        assert!(!re.is_match("/v2/api/users"));
        let re = compile_glob("/exact").unwrap();
        assert!(re.is_match("/exact"));
        assert!(!re.is_match("/exact/sub"));
    }

    #[test]
    fn test_schema_rejects_nonpositive_rate() {
        let err = RateLimitPlugin
            .check_schema(&serde_json::json!({ "capacity": 0 }))
            .unwrap_err();
        assert!(err.to_string().contains("positive"));
    }
}
