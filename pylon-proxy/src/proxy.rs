use crate::balancer::{LoadBalancer, SelectionHints, Strategy};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::dispatch::{self, UpstreamResponse, build_upstream_request};
use crate::health::HealthTable;
use crate::pool::{ConnectionPool, Connector, PoolConfig};
use crate::timeout::{CleanupManager, ResourceKind, TimeoutConfig, TimeoutKind, TimeoutManager};
use bytes::Bytes;
use pylon_core::config::GatewayConfig;
use pylon_core::context::{ContextHandle, ContextPool, RequestContext};
use pylon_core::error::GatewayError;
use pylon_core::route::Route;
use pylon_core::router::Router;
use pylon_core::upstream::Upstream;
use pylon_observability::access_log::{AccessLogEntry, AccessLogger};
use pylon_observability::metrics::MetricsAggregator;
use pylon_observability::pii::PiiScrubber;
use pylon_observability::prometheus_exporter::PrometheusExporter;
use pylon_plugin::chain::{ChainConfig, PluginChain, PluginOptions};
use pylon_plugin::plugin::Hook;
use pylon_plugin::registry::PluginRegistry;
use pylon_traffic::cache::{self, CacheConfig, CacheEntry, Freshness, ResponseCache};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const NOT_FOUND_BODY: &[u8] = br#"{"error":"no route matched","status":404}"#;

/// A request parsed off the wire; everything borrows the read buffer.
pub struct ParsedRequest<'a> {
    /// Uppercase method.
    pub method: &'a str,
    /// Path plus optional query string.
    pub target: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
    pub client_ip: &'a str,
}

/// The response to write back to the client.
#[derive(Debug)]
pub struct FinalResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FinalResponse {
    fn json(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.into(),
        }
    }
}

/// Per-request state carried from `handle` to `finish` (the post-write
/// half of the lifecycle).
pub struct InFlight {
    handle: Option<ContextHandle>,
    ctx: Box<RequestContext>,
    cancel_id: u64,
    route_id: Option<String>,
    cache_outcome: Option<&'static str>,
    is_error: bool,
}

/// Everything a worker needs to build its gateway.
pub struct GatewayParts<C: Connector> {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<Router>,
    pub registry: Arc<PluginRegistry>,
    pub metrics: Arc<MetricsAggregator>,
    pub prometheus: Arc<PrometheusExporter>,
    pub health: Arc<HealthTable>,
    pub connector: C,
}

/// Worker-local request pipeline: plugin chain, router, cache, rate
/// limiting (as a plugin), balancer, breakers, pooled dispatch.
///
/// Shared across the worker's connections via `Rc`; interior state uses
/// short non-await `RefCell` borrows only.
pub struct Gateway<C: Connector> {
    config: Arc<GatewayConfig>,
    router: Arc<Router>,
    chain: PluginChain,
    cache: RefCell<ResponseCache>,
    revalidating: RefCell<HashSet<String>>,
    balancer: RefCell<LoadBalancer>,
    breakers: RefCell<HashMap<String, CircuitBreaker>>,
    pool: ConnectionPool<C>,
    timeouts: TimeoutManager,
    cleanup: CleanupManager,
    ctx_pool: RefCell<ContextPool>,
    metrics: Arc<MetricsAggregator>,
    prometheus: Arc<PrometheusExporter>,
    health: Arc<HealthTable>,
    health_seen: Cell<u64>,
    access: AccessLogger,
    scrubber: PiiScrubber,
    upstreams: HashMap<String, Arc<Upstream>>,
}

impl<C: Connector + 'static> Gateway<C>
where
    C::Conn: dispatch::ProxyStream + 'static,
{
    pub fn new(parts: GatewayParts<C>) -> Rc<Self> {
        let config = parts.config;
        let production = config.environment.is_production();

        let chain = build_chain(&parts.registry, &config);

        let strategy: Strategy = config
            .balancer
            .strategy
            .parse()
            .unwrap_or(Strategy::RoundRobin);
        let mut balancer = LoadBalancer::new(strategy, config.balancer.health_aware);
        let upstream_arcs: Vec<Arc<Upstream>> =
            config.upstreams.iter().cloned().map(Arc::new).collect();
        balancer.set_upstreams(upstream_arcs.clone());
        let upstreams: HashMap<String, Arc<Upstream>> = upstream_arcs
            .iter()
            .map(|u| (u.id.clone(), Arc::clone(u)))
            .collect();

        let cache = ResponseCache::new(CacheConfig {
            max_entries: config.cache.max_entries,
            max_size_bytes: config.cache.max_size_bytes,
            default_ttl: Duration::from_secs(config.cache.default_ttl_secs),
        });

        let ctx_pool = if config.performance.enable_pooling {
            ContextPool::new(config.performance.context_pool_size)
        } else {
            ContextPool::new(0)
        };

        let timeouts = TimeoutManager::new(TimeoutConfig {
            request: Duration::from_millis(config.server.request_timeout_ms),
            idle: Duration::from_millis(config.server.keep_alive_timeout_ms),
            ..TimeoutConfig::default()
        });

        Rc::new(Self {
            router: parts.router,
            chain,
            cache: RefCell::new(cache),
            revalidating: RefCell::new(HashSet::new()),
            balancer: RefCell::new(balancer),
            breakers: RefCell::new(HashMap::new()),
            pool: ConnectionPool::new(parts.connector, PoolConfig::default()),
            timeouts,
            cleanup: CleanupManager::new(),
            ctx_pool: RefCell::new(ctx_pool),
            metrics: parts.metrics,
            prometheus: parts.prometheus,
            health: parts.health,
            health_seen: Cell::new(0),
            access: AccessLogger::new(production),
            scrubber: PiiScrubber::new(),
            upstreams,
            config,
        })
    }

    /// One-shot async setup: plugin INIT hooks and pool pre-warm.
    pub async fn init(self: &Rc<Self>) {
        self.chain.initialize_all().await;
        let addrs: Vec<String> = self.upstreams.values().map(|u| u.addr()).collect();
        let warm_limit = self
            .upstreams
            .values()
            .map(|u| u.pool_size)
            .min()
            .unwrap_or(0);
        if warm_limit > 0 {
            self.pool.warm(&addrs, (warm_limit / 2).max(1), warm_limit).await;
        }
    }

    /// Plugin DESTROY hooks plus resource teardown.
    pub async fn shutdown(self: &Rc<Self>) {
        self.chain.destroy_all().await;
        self.cleanup.shutdown();
        self.timeouts.cancel_all();
        self.pool.destroy();
    }

    pub fn chain(&self) -> &PluginChain {
        &self.chain
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn server_config(&self) -> &pylon_core::config::ServerConfig {
        &self.config.server
    }

    pub fn connection_opened(&self) {
        self.metrics.connection_opened();
        self.prometheus.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.metrics.connection_closed();
        self.prometheus.active_connections.dec();
    }

    /// Periodic worker maintenance: reap idle pool connections and
    /// report leaked timeout handles.
    pub fn housekeeping(&self) {
        self.pool.reap_idle();
        self.timeouts.leaked();
    }

    /// Mirror health-table changes into the balancer (version-gated, so
    /// the steady state is one atomic load).
    pub fn refresh_health_mirror(&self) {
        let version = self.health.version();
        if version == self.health_seen.get() {
            return;
        }
        let mut balancer = self.balancer.borrow_mut();
        for (id, healthy) in self.health.snapshot() {
            balancer.update_health(&id, healthy);
        }
        self.health_seen.set(version);
    }

    /// Run the pre-write half of the request lifecycle. The returned
    /// `InFlight` must be passed to [`Gateway::finish`] after the
    /// response bytes are written.
    pub async fn handle(self: &Rc<Self>, req: ParsedRequest<'_>) -> (FinalResponse, Option<InFlight>) {
        self.refresh_health_mirror();

        // Built-in endpoints short-cut the whole pipeline.
        if req.method == "GET" {
            let path_only = req.target.split('?').next().unwrap_or(req.target);
            match path_only {
                "/health" => {
                    let body = format!(
                        r#"{{"status":"ok","uptime":{}}}"#,
                        self.metrics.uptime().as_secs()
                    );
                    return (FinalResponse::json(200, body), None);
                }
                "/metrics" => {
                    let body = serde_json::to_vec(&self.metrics.snapshot())
                        .unwrap_or_else(|_| b"{}".to_vec());
                    return (FinalResponse::json(200, body), None);
                }
                "/metrics/prometheus" => {
                    let text = self.prometheus.gather_text();
                    return (
                        FinalResponse {
                            status: 200,
                            headers: vec![(
                                "content-type".to_string(),
                                "text/plain; version=0.0.4".to_string(),
                            )],
                            body: Bytes::from(text),
                        },
                        None,
                    );
                }
                _ => {}
            }
        }

        // ── Acquire context ──
        let (handle, mut ctx) = if self.config.performance.enable_pooling {
            let (h, c) = self.ctx_pool.borrow_mut().acquire();
            (Some(h), c)
        } else {
            (None, Box::default())
        };
        ctx.begin(req.method, req.target, req.client_ip);
        for (name, value) in req.headers {
            ctx.headers.append(name, *value);
        }
        if !req.body.is_empty() {
            ctx.body = Some(Bytes::copy_from_slice(req.body));
        }

        let mut request_error: Option<GatewayError> = None;

        // ── PRE_ROUTE ──
        if let Err(e) = self.chain.execute_hook(Hook::PreRoute, &mut ctx, None).await {
            request_error = Some(e);
        }
        if ctx.correlation_id.is_empty() {
            ctx.correlation_id = uuid::Uuid::new_v4().to_string();
        }

        // Request-scoped cancellation controller, released in finish().
        let cancel = self.timeouts.create_handle(TimeoutKind::Request);
        self.cleanup
            .register(&ctx.correlation_id, ResourceKind::Controller, cancel.token.clone());

        // ── Route match ──
        if request_error.is_none() && !ctx.responded {
            match self.router.match_route(&ctx.method, &ctx.path) {
                Some(matched) => {
                    ctx.timestamps.route_match = Some(Instant::now());
                    ctx.params.clear();
                    for (k, v) in matched.params {
                        ctx.params.insert(k, v);
                    }
                    ctx.route = Some(matched.route);
                }
                None => {
                    debug!(method = %ctx.method, path = %ctx.path, "No route matched");
                    ctx.respond(
                        404,
                        vec![("content-type".to_string(), "application/json".to_string())],
                        NOT_FOUND_BODY,
                    );
                }
            }
        }

        // ── PRE_HANDLER ──
        if request_error.is_none() {
            ctx.timestamps.plugin_start = Some(Instant::now());
            if let Err(e) = self.chain.execute_hook(Hook::PreHandler, &mut ctx, None).await {
                request_error = Some(e);
            }
            ctx.timestamps.plugin_end = Some(Instant::now());
        }

        // ── Cache lookup ──
        let mut cache_outcome: Option<&'static str> = None;
        let mut cache_store_key: Option<String> = None;
        let cache_policy = ctx.route.as_ref().and_then(|r| r.cache.clone());
        if request_error.is_none()
            && !ctx.responded
            && self.config.cache.enabled
            && cache_policy.is_some()
            && (ctx.method == "GET" || ctx.method == "HEAD")
        {
            let key = cache::generate_key(&ctx.method, req.target, &[]);
            let lookup = {
                let mut cache = self.cache.borrow_mut();
                cache.get(&key).map(|(entry, freshness)| {
                    (
                        entry.status,
                        entry.headers.clone(),
                        entry.body.clone(),
                        entry.etag.clone(),
                        cache::check_conditional(
                            ctx.headers.get("if-none-match"),
                            ctx.headers.get("if-modified-since"),
                            entry,
                        ),
                        freshness,
                    )
                })
            };
            match lookup {
                Some((status, headers, body, etag, conditional_hit, freshness)) => {
                    cache_outcome = Some(match freshness {
                        Freshness::Fresh => "hit",
                        Freshness::Stale => "stale",
                    });
                    self.prometheus
                        .cache_events
                        .with_label_values(&[cache_outcome.unwrap_or("hit")])
                        .inc();

                    let mut response_headers = headers;
                    for (name, value) in std::mem::take(&mut ctx.response.headers) {
                        upsert_header(&mut response_headers, &name, value);
                    }
                    if let Some(etag) = etag {
                        upsert_header(&mut response_headers, "etag", etag);
                    }
                    upsert_header(
                        &mut response_headers,
                        "x-cache",
                        if freshness == Freshness::Fresh { "HIT" } else { "STALE" },
                    );

                    if conditional_hit {
                        ctx.respond(304, response_headers, Bytes::new());
                    } else {
                        ctx.respond(status, response_headers, body);
                    }

                    if freshness == Freshness::Stale {
                        self.spawn_revalidation(&ctx, &key, req.target);
                    }
                }
                None => {
                    cache_outcome = Some("miss");
                    self.prometheus.cache_events.with_label_values(&["miss"]).inc();
                    cache_store_key = Some(key);
                }
            }
        }

        // ── Upstream dispatch ──
        if request_error.is_none() && !ctx.responded {
            let route = ctx.route.clone().expect("route set when not responded");
            match self.select_upstream(&route, &ctx.client_ip) {
                None => {
                    request_error =
                        Some(GatewayError::Connection("no healthy upstream available".into()));
                }
                Some(upstream) => {
                    ctx.upstream_id = Some(Arc::from(upstream.id.as_str()));
                    ctx.timestamps.upstream_start = Some(Instant::now());

                    let request_budget = route
                        .timeout
                        .as_ref()
                        .and_then(|t| t.request_ms)
                        .unwrap_or(self.config.server.request_timeout_ms);
                    let attempt_budget = route
                        .timeout
                        .as_ref()
                        .and_then(|t| t.upstream_ms)
                        .unwrap_or(upstream.request_timeout_ms);

                    let outcome = self
                        .timeouts
                        .execute(
                            TimeoutKind::Request,
                            Some(Duration::from_millis(request_budget)),
                            self.dispatch_with_retries(
                                &upstream,
                                &ctx,
                                req.target,
                                Duration::from_millis(attempt_budget),
                            ),
                        )
                        .await
                        .and_then(|inner| inner);

                    ctx.timestamps.upstream_end = Some(Instant::now());
                    let elapsed_ms = ctx
                        .timestamps
                        .upstream_start
                        .map(|t| t.elapsed().as_secs_f64() * 1000.0)
                        .unwrap_or(0.0);

                    match outcome {
                        Ok(resp) => {
                            self.health.record_passive(&upstream.id, resp.status < 500);
                            {
                                let mut balancer = self.balancer.borrow_mut();
                                balancer.record_latency(&upstream.id, elapsed_ms);
                                if resp.status >= 500 {
                                    balancer.record_error(&upstream.id);
                                }
                            }
                            // Headers set by earlier hooks (rate-limit
                            // accounting etc.) survive on top of the
                            // upstream's.
                            let pre_set = std::mem::take(&mut ctx.response.headers);
                            ctx.response.status = resp.status;
                            ctx.response.headers = resp.headers;
                            for (name, value) in pre_set {
                                upsert_header(&mut ctx.response.headers, &name, value);
                            }
                            ctx.response.body = resp.body;
                        }
                        Err(e) => {
                            self.health.record_passive(&upstream.id, false);
                            self.balancer.borrow_mut().record_error(&upstream.id);
                            request_error = Some(e);
                        }
                    }
                }
            }
        }

        // ── POST_HANDLER ──
        if request_error.is_none() && !ctx.responded && ctx.response.status != 0 {
            if let Err(e) = self.chain.execute_hook(Hook::PostHandler, &mut ctx, None).await {
                request_error = Some(e);
            }
        }

        // ── Cache store ──
        if request_error.is_none()
            && let Some(key) = cache_store_key
            && cache::is_cacheable(&ctx.method, ctx.response.status, &ctx.response.headers)
        {
            let policy = cache_policy.as_ref().expect("cache path requires policy");
            let directives = ctx
                .response
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("cache-control"))
                .map(|(_, v)| cache::CacheControl::parse(v))
                .unwrap_or_default();
            let ttl = directives.ttl(Duration::from_secs(policy.ttl_secs));
            let entry = CacheEntry::new(
                ctx.response.status,
                ctx.response.headers.clone(),
                ctx.response.body.clone(),
                ttl,
                policy
                    .stale_while_revalidate_secs
                    .map(Duration::from_secs),
                Instant::now(),
            );
            self.cache.borrow_mut().set(&key, entry);
        }

        // Success path: freeze the assembled response.
        if request_error.is_none() && !ctx.responded && ctx.response.status != 0 {
            ctx.responded = true;
        }

        // ── Error path ──
        let is_error = request_error.is_some();
        if let Some(ref err) = request_error {
            let _ = self.chain.execute_hook(Hook::OnError, &mut ctx, Some(err)).await;
            if !ctx.responded {
                let response = self.error_response(err, &ctx);
                ctx.respond(response.status, response.headers, response.body);
            }
        }

        // Anything still unresponded here slipped every path.
        if !ctx.responded {
            error!(path = %ctx.path, "Request fell through without a response");
            let err = GatewayError::Internal("unhandled request state".into());
            let response = self.error_response(&err, &ctx);
            ctx.respond(response.status, response.headers, response.body);
        }

        let mut response = FinalResponse {
            status: ctx.response.status,
            headers: std::mem::take(&mut ctx.response.headers),
            body: std::mem::take(&mut ctx.response.body),
        };
        if !response
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        {
            response
                .headers
                .push(("content-type".to_string(), "application/octet-stream".to_string()));
        }

        let route_id = ctx.route.as_ref().map(|r| r.id.clone());
        (
            response,
            Some(InFlight {
                handle,
                ctx,
                cancel_id: cancel.id,
                route_id,
                cache_outcome,
                is_error,
            }),
        )
    }

    /// Post-write half: POST_RESPONSE hooks, metrics, access log, and
    /// context/resource release.
    pub async fn finish(
        self: &Rc<Self>,
        mut inflight: InFlight,
        status: u16,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        let _ = self
            .chain
            .execute_hook(Hook::PostResponse, &mut inflight.ctx, None)
            .await;

        let ctx = &inflight.ctx;
        let latency_us = ctx
            .started_at
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);
        self.metrics
            .record_request(latency_us, bytes_in, bytes_out, inflight.is_error || status >= 400);
        self.prometheus.record_request(
            inflight.route_id.as_deref().unwrap_or("-"),
            &ctx.method,
            status,
            latency_us as f64 / 1_000_000.0,
        );

        let mut log_headers: Vec<(String, String)> = ctx
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.access.log(
            AccessLogEntry {
                timestamp: chrono::Utc::now().to_rfc3339(),
                request_id: ctx.correlation_id.clone(),
                route_id: inflight.route_id.clone().unwrap_or_else(|| "-".into()),
                client_ip: ctx.client_ip.clone(),
                method: ctx.method.clone(),
                path: ctx.path.clone(),
                status,
                latency_ms: latency_us as f64 / 1000.0,
                upstream_id: ctx.upstream_id.as_ref().map(|u| u.to_string()),
                cache: inflight.cache_outcome,
            },
            &mut log_headers,
        );

        self.timeouts.complete(inflight.cancel_id);
        self.cleanup.cleanup_request(&ctx.correlation_id);

        if let Some(handle) = inflight.handle {
            self.ctx_pool.borrow_mut().release(handle, inflight.ctx);
        }
    }

    fn select_upstream(&self, route: &Route, client_ip: &str) -> Option<Arc<Upstream>> {
        if let Some(ref id) = route.upstream_id {
            let upstream = self.upstreams.get(id)?;
            if self.config.balancer.health_aware && !self.health.is_healthy(id) {
                return None;
            }
            return Some(Arc::clone(upstream));
        }
        self.balancer.borrow_mut().select(SelectionHints {
            client_ip: Some(client_ip),
        })
    }

    /// Breaker-gated, pooled, retried upstream dispatch.
    async fn dispatch_with_retries(
        self: &Rc<Self>,
        upstream: &Arc<Upstream>,
        ctx: &RequestContext,
        target: &str,
        attempt_budget: Duration,
    ) -> Result<UpstreamResponse, GatewayError> {
        let header_refs: Vec<(&str, &str)> = ctx.headers.iter().collect();
        let body = ctx.body.as_deref().unwrap_or(&[]);
        let upstream_target = if upstream.base_path.is_empty() {
            target.to_string()
        } else {
            format!("{}{}", upstream.base_path.trim_end_matches('/'), target)
        };

        let mut request_bytes = Vec::with_capacity(512 + body.len());
        build_upstream_request(
            &mut request_bytes,
            &ctx.method,
            &upstream_target,
            &header_refs,
            body,
            &ctx.client_ip,
        );

        self.dispatch_prepared(
            upstream,
            &request_bytes,
            ctx.method == "HEAD",
            attempt_budget,
        )
        .await
    }

    async fn dispatch_prepared(
        self: &Rc<Self>,
        upstream: &Arc<Upstream>,
        request_bytes: &[u8],
        head_request: bool,
        attempt_budget: Duration,
    ) -> Result<UpstreamResponse, GatewayError> {
        let addr = upstream.addr();
        let attempts = upstream.retries + 1;
        let mut last_err = None;

        for attempt in 0..attempts {
            // Circuit gate: the fast-fail path is a map probe plus a
            // clock read, no allocation.
            {
                let mut breakers = self.breakers.borrow_mut();
                let breaker = breakers.entry(upstream.id.clone()).or_insert_with(|| {
                    let cb = &self.config.circuit_breaker;
                    CircuitBreaker::new(
                        upstream.id.clone(),
                        BreakerConfig {
                            failure_threshold: cb.failure_threshold,
                            success_threshold: cb.success_threshold,
                            window_size: cb.window_size,
                            open_timeout: Duration::from_millis(cb.open_timeout_ms),
                        },
                    )
                });
                breaker.try_acquire()?;
            }

            let attempt_result = self
                .attempt_once(&addr, upstream, request_bytes, head_request, attempt_budget)
                .await;

            match attempt_result {
                Ok(resp) => {
                    let mut breakers = self.breakers.borrow_mut();
                    if let Some(breaker) = breakers.get_mut(upstream.id.as_str()) {
                        if resp.status >= 500 {
                            breaker.on_failure();
                        } else {
                            breaker.on_success();
                        }
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if let Some(breaker) =
                        self.breakers.borrow_mut().get_mut(upstream.id.as_str())
                    {
                        breaker.on_failure();
                    }
                    let retry = e.retryable() && attempt + 1 < attempts;
                    warn!(
                        upstream = %upstream.id,
                        attempt,
                        error = %e,
                        retrying = retry,
                        "Upstream attempt failed"
                    );
                    if !retry {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::Upstream("retries exhausted".into())))
    }

    async fn attempt_once(
        self: &Rc<Self>,
        addr: &str,
        upstream: &Arc<Upstream>,
        request_bytes: &[u8],
        head_request: bool,
        attempt_budget: Duration,
    ) -> Result<UpstreamResponse, GatewayError> {
        let mut lease = self
            .pool
            .acquire(
                addr,
                upstream.pool_size,
                Some(Duration::from_millis(upstream.connect_timeout_ms)),
            )
            .await?;

        let forwarded = self
            .timeouts
            .execute(
                TimeoutKind::Upstream,
                Some(attempt_budget),
                dispatch::forward(
                    &mut lease.conn,
                    request_bytes,
                    head_request,
                    self.config.server.max_body_size,
                ),
            )
            .await;

        match forwarded {
            Ok(Ok(resp)) => {
                if resp.keep_alive {
                    self.pool.release(lease);
                } else {
                    self.pool.discard(lease);
                }
                Ok(resp)
            }
            Ok(Err(e)) => {
                // Wire error mid-exchange: the connection is poisoned.
                self.pool.discard(lease);
                Err(e)
            }
            Err(timeout_err) => {
                // Bytes may have been exchanged; destroy, never pool.
                self.pool.discard(lease);
                Err(timeout_err)
            }
        }
    }

    /// Serve-stale support: refresh the entry in the background, deduped
    /// per key.
    fn spawn_revalidation(self: &Rc<Self>, ctx: &RequestContext, key: &str, target: &str) {
        if !self.revalidating.borrow_mut().insert(key.to_string()) {
            return;
        }
        let Some(route) = ctx.route.clone() else {
            self.revalidating.borrow_mut().remove(key);
            return;
        };
        let gateway = Rc::clone(self);
        let key = key.to_string();
        let target = target.to_string();
        let method = ctx.method.clone();
        let client_ip = ctx.client_ip.clone();
        let headers: Vec<(String, String)> = ctx
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        monoio::spawn(async move {
            gateway
                .revalidate(route, key, method, target, client_ip, headers)
                .await;
        });
    }

    async fn revalidate(
        self: Rc<Self>,
        route: Arc<Route>,
        key: String,
        method: String,
        target: String,
        client_ip: String,
        headers: Vec<(String, String)>,
    ) {
        let result = async {
            let upstream = self
                .select_upstream(&route, &client_ip)
                .ok_or_else(|| GatewayError::Connection("no healthy upstream".into()))?;
            let header_refs: Vec<(&str, &str)> =
                headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let upstream_target = if upstream.base_path.is_empty() {
                target.clone()
            } else {
                format!("{}{}", upstream.base_path.trim_end_matches('/'), target)
            };
            let mut request_bytes = Vec::with_capacity(512);
            build_upstream_request(
                &mut request_bytes,
                &method,
                &upstream_target,
                &header_refs,
                &[],
                &client_ip,
            );
            self.dispatch_prepared(
                &upstream,
                &request_bytes,
                method == "HEAD",
                Duration::from_millis(upstream.request_timeout_ms),
            )
            .await
        }
        .await;

        match result {
            Ok(resp) if cache::is_cacheable(&method, resp.status, &resp.headers) => {
                if let Some(policy) = &route.cache {
                    let entry = CacheEntry::new(
                        resp.status,
                        resp.headers,
                        resp.body,
                        Duration::from_secs(policy.ttl_secs),
                        policy.stale_while_revalidate_secs.map(Duration::from_secs),
                        Instant::now(),
                    );
                    self.cache.borrow_mut().set(&key, entry);
                    debug!(key = %key, "Stale cache entry revalidated");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(key = %key, error = %e, "Cache revalidation failed"),
        }
        self.revalidating.borrow_mut().remove(&key);
    }

    /// Build the error envelope response, scrubbing PII and omitting
    /// internals in production.
    fn error_response(&self, err: &GatewayError, ctx: &RequestContext) -> FinalResponse {
        let production = self.config.environment.is_production();
        let request_id = if ctx.correlation_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            ctx.correlation_id.clone()
        };

        let details = if production {
            None
        } else {
            Some(serde_json::json!({
                "route": ctx.route.as_ref().map(|r| r.id.as_str()),
                "upstream": ctx.upstream_id.as_deref(),
                "method": ctx.method,
                "path": ctx.path,
            }))
        };

        let mut envelope = err.to_envelope(Some(&request_id), details);
        if production {
            envelope.error.message = self.scrubber.scrub_text(&envelope.error.message);
        }

        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("X-Error-Code".to_string(), err.code().to_string()),
            ("X-Request-ID".to_string(), request_id),
        ];
        if err.status_code() == 429 {
            headers.push((
                "Retry-After".to_string(),
                err.retry_after_secs().unwrap_or(60).to_string(),
            ));
        }

        FinalResponse {
            status: err.status_code(),
            headers,
            body: Bytes::from(envelope.to_json_body()),
        }
    }
}

fn upsert_header(headers: &mut Vec<(String, String)>, name: &str, value: impl Into<String>) {
    let value = value.into();
    for (k, v) in headers.iter_mut() {
        if k.eq_ignore_ascii_case(name) {
            *v = value;
            return;
        }
    }
    headers.push((name.to_string(), value));
}

/// Build the worker's plugin chain from the configured plugin list.
fn build_chain(registry: &PluginRegistry, config: &GatewayConfig) -> PluginChain {
    let chain = PluginChain::new(ChainConfig::default());
    for entry in &config.plugins {
        let Some(factory) = registry.get(&entry.name) else {
            warn!(plugin = %entry.name, "Unknown plugin in config, skipping");
            continue;
        };
        match factory.configure(&entry.settings) {
            Ok(instance) => {
                chain.register(
                    instance,
                    PluginOptions {
                        order: entry.order,
                        timeout: entry.timeout_ms.map(Duration::from_millis),
                    },
                );
                if !entry.enabled {
                    chain.disable(&entry.name);
                }
            }
            Err(e) => {
                error!(plugin = %entry.name, error = %e, "Plugin configuration failed");
            }
        }
    }
    chain
}
