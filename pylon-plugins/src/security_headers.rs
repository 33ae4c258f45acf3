use async_trait::async_trait;
use pylon_core::context::RequestContext;
use pylon_plugin::plugin::{Hook, HookResult, Plugin, PluginInstance};
use serde::Deserialize;

/// Response-hardening plugin: injects standard security headers into
/// every upstream response.
///
/// All fields have safe defaults so an empty `settings: {}` block is
/// effective as-is.
pub struct SecurityHeadersPlugin;

#[derive(Debug, Deserialize, Clone)]
struct SecurityHeadersConfig {
    /// `Strict-Transport-Security: max-age=<N>` (seconds).
    #[serde(default = "default_hsts_max_age")]
    hsts_max_age: u64,

    /// `X-Frame-Options` value; empty string omits the header.
    #[serde(default = "default_frame_options")]
    x_frame_options: String,

    /// Emit `X-Content-Type-Options: nosniff`.
    #[serde(default = "default_true")]
    x_content_type_options: bool,

    /// `Referrer-Policy` value.
    #[serde(default = "default_referrer_policy")]
    referrer_policy: String,

    /// `Content-Security-Policy` value; empty string omits the header.
    #[serde(default)]
    content_security_policy: String,
}

fn default_hsts_max_age() -> u64 {
    31_536_000
}
fn default_true() -> bool {
    true
}
fn default_frame_options() -> String {
    "DENY".into()
}
fn default_referrer_policy() -> String {
    "no-referrer".into()
}

impl Plugin for SecurityHeadersPlugin {
    fn name(&self) -> &str {
        "security-headers"
    }

    fn configure(&self, settings: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let cfg: SecurityHeadersConfig = serde_json::from_value(settings.clone())?;
        Ok(Box::new(SecurityHeadersInstance { cfg }))
    }
}

struct SecurityHeadersInstance {
    cfg: SecurityHeadersConfig,
}

#[async_trait(?Send)]
impl PluginInstance for SecurityHeadersInstance {
    fn name(&self) -> &str {
        "security-headers"
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::PostHandler]
    }

    async fn post_handler(&self, ctx: &mut RequestContext) -> HookResult {
        ctx.set_response_header(
            "Strict-Transport-Security",
            format!("max-age={}", self.cfg.hsts_max_age),
        );
        if !self.cfg.x_frame_options.is_empty() {
            let v = self.cfg.x_frame_options.clone();
            ctx.set_response_header("X-Frame-Options", v);
        }
        if self.cfg.x_content_type_options {
            ctx.set_response_header("X-Content-Type-Options", "nosniff");
        }
        if !self.cfg.referrer_policy.is_empty() {
            let v = self.cfg.referrer_policy.clone();
            ctx.set_response_header("Referrer-Policy", v);
        }
        if !self.cfg.content_security_policy.is_empty() {
            let v = self.cfg.content_security_policy.clone();
            ctx.set_response_header("Content-Security-Policy", v);
        }
        HookResult::Continue
    }
}
