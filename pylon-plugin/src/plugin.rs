use async_trait::async_trait;
use pylon_core::context::RequestContext;
use pylon_core::error::GatewayError;
use serde_json::Value;

/// Plugin lifecycle hooks, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    /// One-shot setup when the chain starts
    Init = 0,
    /// Before route matching
    PreRoute = 1,
    /// After routing, before upstream dispatch
    PreHandler = 2,
    /// After the upstream response, before it is written
    PostHandler = 3,
    /// After the response has been written (non-blocking work)
    PostResponse = 4,
    /// On any request error; receives the error
    OnError = 5,
    /// One-shot teardown at shutdown
    Destroy = 6,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::Init => "init",
            Hook::PreRoute => "pre_route",
            Hook::PreHandler => "pre_handler",
            Hook::PostHandler => "post_handler",
            Hook::PostResponse => "post_response",
            Hook::OnError => "on_error",
            Hook::Destroy => "destroy",
        }
    }

    pub fn all() -> &'static [Hook] {
        &[
            Hook::Init,
            Hook::PreRoute,
            Hook::PreHandler,
            Hook::PostHandler,
            Hook::PostResponse,
            Hook::OnError,
            Hook::Destroy,
        ]
    }

    /// Hooks executed per request (everything but Init/Destroy).
    pub fn runtime() -> &'static [Hook] {
        &[
            Hook::PreRoute,
            Hook::PreHandler,
            Hook::PostHandler,
            Hook::PostResponse,
            Hook::OnError,
        ]
    }

    /// Hooks that still run after a response has been produced.
    pub fn runs_after_respond(&self) -> bool {
        matches!(self, Hook::PostResponse | Hook::OnError)
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one plugin hook execution.
#[derive(Debug)]
pub enum HookResult {
    /// Continue to the next plugin
    Continue,

    /// Short-circuit the request with this response (e.g. 401, 429)
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },

    /// The hook failed
    Fail(GatewayError),
}

/// A plugin factory: registered once, configured per activation.
pub trait Plugin: Send + Sync {
    /// Plugin name (must be unique)
    fn name(&self) -> &str;

    /// Validate plugin settings without instantiating.
    fn check_schema(&self, settings: &Value) -> anyhow::Result<()> {
        let _ = settings;
        Ok(())
    }

    /// Build an instance bound to these settings.
    fn configure(&self, settings: &Value) -> anyhow::Result<Box<dyn PluginInstance>>;
}

/// A configured plugin bound into a worker's chain.
///
/// Hooks are async and `?Send`: instances are worker-local and may keep
/// interior state behind `RefCell`.
#[async_trait(?Send)]
pub trait PluginInstance {
    fn name(&self) -> &str;

    /// The subset of hooks this instance implements.
    fn hooks(&self) -> &[Hook];

    async fn init(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn pre_route(&self, _ctx: &mut RequestContext) -> HookResult {
        HookResult::Continue
    }

    async fn pre_handler(&self, _ctx: &mut RequestContext) -> HookResult {
        HookResult::Continue
    }

    async fn post_handler(&self, _ctx: &mut RequestContext) -> HookResult {
        HookResult::Continue
    }

    async fn post_response(&self, _ctx: &mut RequestContext) -> HookResult {
        HookResult::Continue
    }

    async fn on_error(&self, _ctx: &mut RequestContext, _error: &GatewayError) -> HookResult {
        HookResult::Continue
    }

    async fn destroy(&self) {}
}
