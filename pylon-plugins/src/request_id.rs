use async_trait::async_trait;
use pylon_core::context::RequestContext;
use pylon_plugin::plugin::{Hook, HookResult, Plugin, PluginInstance};
use serde::Deserialize;

/// Correlation-id plugin.
///
/// Assigns every request a stable id (reusing a trusted incoming header
/// when configured) and echoes it on the response as `X-Request-ID`.
pub struct RequestIdPlugin;

#[derive(Debug, Deserialize, Clone)]
struct RequestIdConfig {
    /// Header carrying the id on both request and response.
    #[serde(default = "default_header")]
    header_name: String,

    /// Accept an id supplied by the client instead of minting one.
    #[serde(default = "default_true")]
    trust_incoming: bool,
}

fn default_header() -> String {
    "X-Request-ID".to_string()
}

fn default_true() -> bool {
    true
}

impl Plugin for RequestIdPlugin {
    fn name(&self) -> &str {
        "request-id"
    }

    fn configure(&self, settings: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let cfg: RequestIdConfig = serde_json::from_value(settings.clone())?;
        Ok(Box::new(RequestIdInstance { cfg }))
    }
}

struct RequestIdInstance {
    cfg: RequestIdConfig,
}

#[async_trait(?Send)]
impl PluginInstance for RequestIdInstance {
    fn name(&self) -> &str {
        "request-id"
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::PreRoute, Hook::PostHandler]
    }

    async fn pre_route(&self, ctx: &mut RequestContext) -> HookResult {
        let incoming = if self.cfg.trust_incoming {
            ctx.headers.get(&self.cfg.header_name).map(str::to_string)
        } else {
            None
        };
        ctx.correlation_id =
            incoming.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        HookResult::Continue
    }

    async fn post_handler(&self, ctx: &mut RequestContext) -> HookResult {
        if !ctx.correlation_id.is_empty() {
            let id = ctx.correlation_id.clone();
            ctx.set_response_header(&self.cfg.header_name, id);
        }
        HookResult::Continue
    }
}
