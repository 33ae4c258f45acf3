use crate::events::EventBus;
use crate::metrics::{ExecOutcome, PluginMetrics, PluginMetricsSnapshot};
use crate::plugin::{Hook, HookResult, PluginInstance};
use pylon_core::context::RequestContext;
use pylon_core::error::GatewayError;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Per-hook budget applied when a plugin has no explicit timeout.
    pub default_timeout: Duration,

    /// Abort the request on the first plugin error instead of continuing
    /// down the chain.
    pub short_circuit_on_error: bool,

    /// Collect per-plugin latency metrics.
    pub metrics_enabled: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(1),
            short_circuit_on_error: false,
            metrics_enabled: true,
        }
    }
}

/// Registration-time options for one plugin.
#[derive(Debug, Default, Clone)]
pub struct PluginOptions {
    /// Chain position; lower runs first. Defaults to registration index.
    pub order: Option<i64>,
    pub timeout: Option<Duration>,
}

struct Registered {
    reg_id: u64,
    name: String,
    order: i64,
    seq: u64,
    timeout: Duration,
    enabled: bool,
    instance: Rc<dyn PluginInstance>,
    metrics: PluginMetrics,
    /// Init failure waiting to surface at the first runtime invocation.
    pending_init_error: Option<String>,
}

struct ChainInner {
    plugins: Vec<Registered>,
    config: ChainConfig,
    next_id: u64,
}

/// Outcome of running one hook across the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every eligible plugin ran.
    Completed,
    /// A plugin produced a response; the rest of this hook was skipped.
    ShortCircuited,
    /// The hook was skipped because a response already exists.
    Skipped,
}

/// Ordered plugin execution chain with per-plugin timeouts, metrics, and
/// short-circuit semantics.
///
/// Worker-local. Cloning shares the underlying chain; `execute_hook`
/// snapshots the plugin list before awaiting so concurrent requests on
/// the same worker never contend on the interior borrow.
#[derive(Clone)]
pub struct PluginChain {
    inner: Rc<RefCell<ChainInner>>,
    bus: EventBus,
}

struct ExecPlan {
    reg_id: u64,
    name: String,
    timeout: Duration,
    instance: Rc<dyn PluginInstance>,
    implements: bool,
    surface_init_error: bool,
}

impl PluginChain {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChainInner {
                plugins: Vec::new(),
                config,
                next_id: 0,
            })),
            bus: EventBus::new(),
        }
    }

    /// The cross-plugin event bus.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Add a configured plugin instance to the chain.
    pub fn register(&self, instance: Box<dyn PluginInstance>, opts: PluginOptions) {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_id;
        inner.next_id += 1;
        let registered = Registered {
            reg_id: seq,
            name: instance.name().to_string(),
            order: opts.order.unwrap_or(seq as i64),
            seq,
            timeout: opts.timeout.unwrap_or(inner.config.default_timeout),
            enabled: true,
            instance: Rc::from(instance),
            metrics: PluginMetrics::default(),
            pending_init_error: None,
        };
        debug!(plugin = %registered.name, order = registered.order, "Plugin added to chain");
        inner.plugins.push(registered);
        inner
            .plugins
            .sort_by(|a, b| a.order.cmp(&b.order).then(a.seq.cmp(&b.seq)));
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().plugins.is_empty()
    }

    /// Enable a plugin by name. Returns `false` if unknown.
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Disable a plugin by name; disabled plugins are skipped at every
    /// hook. Returns `false` if unknown.
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut inner = self.inner.borrow_mut();
        let mut found = false;
        for p in inner.plugins.iter_mut().filter(|p| p.name == name) {
            p.enabled = enabled;
            found = true;
        }
        found
    }

    /// Run every plugin's `Init` hook. Failures are recorded and surface
    /// at the plugin's first runtime invocation; they do not disable it.
    pub async fn initialize_all(&self) {
        let plans = self.snapshot(Hook::Init);
        for plan in plans {
            if !plan.implements {
                continue;
            }
            let started = Instant::now();
            let outcome = monoio::time::timeout(plan.timeout, plan.instance.init()).await;
            let elapsed = started.elapsed().as_micros() as u64;
            match outcome {
                Ok(Ok(())) => self.record(plan.reg_id, elapsed, ExecOutcome::Success),
                Ok(Err(e)) => {
                    warn!(plugin = %plan.name, error = %e, "Plugin init failed");
                    self.record(plan.reg_id, elapsed, ExecOutcome::Error);
                    self.set_init_error(plan.reg_id, e.to_string());
                }
                Err(_) => {
                    warn!(plugin = %plan.name, timeout_ms = plan.timeout.as_millis() as u64, "Plugin init timed out");
                    self.record(plan.reg_id, elapsed, ExecOutcome::Timeout);
                    self.set_init_error(plan.reg_id, "init timed out".to_string());
                }
            }
        }
    }

    /// Run every plugin's `Destroy` hook, ignoring failures.
    pub async fn destroy_all(&self) {
        let plans = self.snapshot(Hook::Destroy);
        for plan in plans {
            if plan.implements {
                let _ = monoio::time::timeout(plan.timeout, plan.instance.destroy()).await;
            }
        }
        self.bus.drain();
    }

    /// Execute one hook across the chain in ascending order.
    ///
    /// Returns `Err` only when `short_circuit_on_error` is configured and
    /// a plugin failed or timed out.
    pub async fn execute_hook(
        &self,
        hook: Hook,
        ctx: &mut RequestContext,
        request_error: Option<&GatewayError>,
    ) -> Result<ChainOutcome, GatewayError> {
        if ctx.responded && !hook.runs_after_respond() {
            return Ok(ChainOutcome::Skipped);
        }

        let short_circuit_on_error = self.inner.borrow().config.short_circuit_on_error;
        let plans = self.snapshot(hook);

        for plan in plans {
            // A recorded init failure surfaces here, once.
            if plan.surface_init_error {
                if let Some(msg) = self.take_init_error(plan.reg_id) {
                    let err = GatewayError::Plugin {
                        plugin: plan.name.clone(),
                        message: format!("init failed: {}", msg),
                    };
                    error!(plugin = %plan.name, error = %err, "Deferred init failure");
                    self.record(plan.reg_id, 0, ExecOutcome::Error);
                    if short_circuit_on_error {
                        self.bus.drain();
                        return Err(err);
                    }
                }
            }
            if !plan.implements {
                continue;
            }

            let started = Instant::now();
            let fallback_error;
            let outcome = {
                let fut = match hook {
                    Hook::PreRoute => plan.instance.pre_route(ctx),
                    Hook::PreHandler => plan.instance.pre_handler(ctx),
                    Hook::PostHandler => plan.instance.post_handler(ctx),
                    Hook::PostResponse => plan.instance.post_response(ctx),
                    Hook::OnError => {
                        let err = match request_error {
                            Some(e) => e,
                            None => {
                                fallback_error = GatewayError::Internal("unspecified".into());
                                &fallback_error
                            }
                        };
                        plan.instance.on_error(ctx, err)
                    }
                    // Init/Destroy run through their dedicated drivers.
                    Hook::Init | Hook::Destroy => continue,
                };
                monoio::time::timeout(plan.timeout, fut).await
            };
            let elapsed = started.elapsed().as_micros() as u64;

            match outcome {
                Err(_) => {
                    let err = GatewayError::PluginTimeout {
                        plugin: plan.name.clone(),
                        hook: hook.as_str().to_string(),
                        ms: plan.timeout.as_millis() as u64,
                    };
                    warn!(plugin = %plan.name, hook = %hook, "Plugin hook timed out");
                    self.record(plan.reg_id, elapsed, ExecOutcome::Timeout);
                    if short_circuit_on_error {
                        self.bus.drain();
                        return Err(err);
                    }
                }
                Ok(HookResult::Continue) => {
                    self.record(plan.reg_id, elapsed, ExecOutcome::Success);
                }
                Ok(HookResult::Respond {
                    status,
                    headers,
                    body,
                }) => {
                    self.record(plan.reg_id, elapsed, ExecOutcome::Success);
                    debug!(plugin = %plan.name, hook = %hook, status, "Plugin produced response");
                    ctx.respond(status, headers, body);
                }
                Ok(HookResult::Fail(err)) => {
                    error!(plugin = %plan.name, hook = %hook, error = %err, "Plugin hook failed");
                    self.record(plan.reg_id, elapsed, ExecOutcome::Error);
                    if short_circuit_on_error {
                        self.bus.drain();
                        return Err(err);
                    }
                }
            }

            if ctx.responded && !hook.runs_after_respond() {
                self.bus.drain();
                return Ok(ChainOutcome::ShortCircuited);
            }
        }

        self.bus.drain();
        Ok(ChainOutcome::Completed)
    }

    /// Metrics snapshot for one plugin.
    pub fn metrics(&self, name: &str) -> Option<PluginMetricsSnapshot> {
        self.inner
            .borrow()
            .plugins
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.metrics.snapshot())
    }

    /// Metrics snapshots for the whole chain, in execution order.
    pub fn all_metrics(&self) -> Vec<(String, PluginMetricsSnapshot)> {
        self.inner
            .borrow()
            .plugins
            .iter()
            .map(|p| (p.name.clone(), p.metrics.snapshot()))
            .collect()
    }

    fn snapshot(&self, hook: Hook) -> Vec<ExecPlan> {
        self.inner
            .borrow()
            .plugins
            .iter()
            .filter(|p| p.enabled)
            .map(|p| ExecPlan {
                reg_id: p.reg_id,
                name: p.name.clone(),
                timeout: p.timeout,
                instance: Rc::clone(&p.instance),
                implements: p.instance.hooks().contains(&hook),
                surface_init_error: p.pending_init_error.is_some()
                    && !matches!(hook, Hook::Init | Hook::Destroy),
            })
            .collect()
    }

    fn record(&self, reg_id: u64, elapsed_us: u64, outcome: ExecOutcome) {
        let mut inner = self.inner.borrow_mut();
        if !inner.config.metrics_enabled {
            return;
        }
        if let Some(p) = inner.plugins.iter_mut().find(|p| p.reg_id == reg_id) {
            p.metrics.record(elapsed_us, outcome);
        }
    }

    fn set_init_error(&self, reg_id: u64, msg: String) {
        let mut inner = self.inner.borrow_mut();
        if let Some(p) = inner.plugins.iter_mut().find(|p| p.reg_id == reg_id) {
            p.pending_init_error = Some(msg);
        }
    }

    fn take_init_error(&self, reg_id: u64) -> Option<String> {
        let mut inner = self.inner.borrow_mut();
        inner
            .plugins
            .iter_mut()
            .find(|p| p.reg_id == reg_id)
            .and_then(|p| p.pending_init_error.take())
    }
}
