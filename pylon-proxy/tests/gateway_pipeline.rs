//! End-to-end pipeline tests: router → plugin chain → cache → balancer
//! → circuit breaker → pooled dispatch, with a scripted connector in
//! place of real sockets.
//!
//! These cover the dispatch decisions that unit tests cannot: plugin
//! short-circuits reaching the wire shape, cache hit/miss flows, breaker
//! fast-fail, and the error envelope contract.

use pylon_core::config::GatewayConfig;
use pylon_core::router::Router;
use pylon_plugin::registry::PluginRegistry;
use pylon_proxy::dispatch::ProxyStream;
use pylon_proxy::health::HealthTable;
use pylon_proxy::pool::Connector;
use pylon_proxy::proxy::{FinalResponse, Gateway, GatewayParts, ParsedRequest};
use pylon_proxy::worker::SharedState;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

// ── Scripted transport ───────────────────────────────────────────────────────

struct ScriptedConn {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
}

impl ProxyStream for ScriptedConn {
    async fn read_into(&mut self, mut buf: Vec<u8>) -> (std::io::Result<usize>, Vec<u8>) {
        match self.reads.pop_front() {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                (Ok(n), buf)
            }
            None => (Ok(0), buf),
        }
    }

    async fn write_all_from(&mut self, buf: Vec<u8>) -> (std::io::Result<()>, Vec<u8>) {
        self.written.extend_from_slice(&buf);
        (Ok(()), buf)
    }
}

/// Pops one canned response per opened connection.
struct ScriptedConnector {
    responses: Rc<RefCell<VecDeque<Vec<u8>>>>,
    fail_connect: Rc<Cell<bool>>,
    connects: Rc<Cell<u64>>,
}

impl Connector for ScriptedConnector {
    type Conn = ScriptedConn;

    async fn connect(&self, _addr: &str) -> std::io::Result<ScriptedConn> {
        if self.fail_connect.get() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ));
        }
        self.connects.set(self.connects.get() + 1);
        let response = self
            .responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(default_backend_response);
        Ok(ScriptedConn {
            reads: VecDeque::from([response]),
            written: Vec::new(),
        })
    }
}

fn default_backend_response() -> Vec<u8> {
    // `connection: close` keeps the scripted conns single-shot.
    b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
        .to_vec()
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    gateway: Rc<Gateway<ScriptedConnector>>,
    responses: Rc<RefCell<VecDeque<Vec<u8>>>>,
    fail_connect: Rc<Cell<bool>>,
    connects: Rc<Cell<u64>>,
    shared: Arc<SharedState>,
}

fn make_rt() -> monoio::Runtime<monoio::time::TimeDriver<monoio::LegacyDriver>> {
    monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
        .enable_timer()
        .build()
        .expect("monoio runtime build failed")
}

fn harness(config_json: serde_json::Value) -> Harness {
    let config: GatewayConfig = serde_json::from_value(config_json).expect("valid config");
    config.validate().expect("config must validate");

    let mut registry = PluginRegistry::new();
    pylon_plugins::register_all(&mut registry);
    let router = Router::build(config.routes.clone());

    let responses = Rc::new(RefCell::new(VecDeque::new()));
    let fail_connect = Rc::new(Cell::new(false));
    let connects = Rc::new(Cell::new(0));

    // SharedState wires the same pieces the server binary does.
    let shared = SharedState::new(config, router, registry);

    let gateway = Gateway::new(GatewayParts {
        config: Arc::clone(&shared.config),
        router: Arc::clone(&shared.router),
        registry: Arc::clone(&shared.registry),
        metrics: Arc::clone(&shared.metrics),
        prometheus: Arc::clone(&shared.prometheus),
        health: Arc::clone(&shared.health),
        connector: ScriptedConnector {
            responses: Rc::clone(&responses),
            fail_connect: Rc::clone(&fail_connect),
            connects: Rc::clone(&connects),
        },
    });

    Harness {
        gateway,
        responses,
        fail_connect,
        connects,
        shared,
    }
}

fn base_config() -> serde_json::Value {
    serde_json::json!({
        "upstreams": [
            { "id": "backend", "host": "127.0.0.1", "port": 9000,
              "connect_timeout_ms": 200, "request_timeout_ms": 500, "retries": 1 }
        ],
        "routes": [
            { "id": "api", "path": "/api/*", "upstream_id": "backend" }
        ]
    })
}

async fn run(h: &Harness, method: &str, target: &str) -> FinalResponse {
    run_with_headers(h, method, target, &[]).await
}

async fn run_with_headers(
    h: &Harness,
    method: &str,
    target: &str,
    headers: &[(&str, &str)],
) -> FinalResponse {
    let req = ParsedRequest {
        method,
        target,
        headers,
        body: b"",
        client_ip: "10.1.1.1",
    };
    let (response, inflight) = h.gateway.handle(req).await;
    if let Some(inflight) = inflight {
        h.gateway
            .finish(inflight, response.status, 0, response.body.len() as u64)
            .await;
    }
    response
}

fn header<'a>(resp: &'a FinalResponse, name: &str) -> Option<&'a str> {
    resp.headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn proxies_matched_route_to_upstream() {
    make_rt().block_on(async {
        let h = harness(base_config());
        let resp = run(&h, "GET", "/api/users?page=1").await;
        assert_eq!(resp.status, 200);
        assert_eq!(&resp.body[..], b"ok");
        assert_eq!(header(&resp, "content-type"), Some("text/plain"));
        assert_eq!(h.connects.get(), 1);
    });
}

#[test]
fn unmatched_path_returns_404() {
    make_rt().block_on(async {
        let h = harness(base_config());
        let resp = run(&h, "GET", "/nope").await;
        assert_eq!(resp.status, 404);
        let parsed: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(parsed["status"], 404);
        assert_eq!(h.connects.get(), 0, "404s never touch the upstream");
    });
}

#[test]
fn request_id_and_security_headers_plugins_decorate_response() {
    make_rt().block_on(async {
        let mut cfg = base_config();
        cfg["plugins"] = serde_json::json!([
            { "name": "request-id" },
            { "name": "security-headers" }
        ]);
        let h = harness(cfg);
        let resp =
            run_with_headers(&h, "GET", "/api/x", &[("x-request-id", "fixed-id")]).await;
        assert_eq!(resp.status, 200);
        assert_eq!(header(&resp, "x-request-id"), Some("fixed-id"));
        assert_eq!(header(&resp, "x-content-type-options"), Some("nosniff"));
        assert!(header(&resp, "strict-transport-security").is_some());
    });
}

#[test]
fn rate_limit_plugin_emits_429_envelope() {
    make_rt().block_on(async {
        let mut cfg = base_config();
        cfg["plugins"] = serde_json::json!([
            { "name": "rate-limit",
              "settings": { "capacity": 1, "refill_rate": 0.1 } }
        ]);
        let h = harness(cfg);

        let first = run(&h, "GET", "/api/x").await;
        assert_eq!(first.status, 200);

        let second = run(&h, "GET", "/api/x").await;
        assert_eq!(second.status, 429);
        assert_eq!(header(&second, "X-RateLimit-Limit"), Some("1"));
        assert_eq!(header(&second, "X-RateLimit-Remaining"), Some("0"));
        assert!(header(&second, "X-RateLimit-Reset").is_some());
        assert!(header(&second, "Retry-After").is_some());

        let body: serde_json::Value = serde_json::from_slice(&second.body).unwrap();
        assert!(body["error"].as_str().is_some());
        assert_eq!(body["limit"], 1);
        assert_eq!(body["remaining"], 0);
        assert!(body["resetIn"].as_f64().is_some());
        assert!(body["retryAfter"].as_f64().is_some());

        assert_eq!(h.connects.get(), 1, "throttled request must not dispatch");
    });
}

#[test]
fn connect_failure_returns_connection_error_envelope() {
    make_rt().block_on(async {
        let h = harness(base_config());
        h.fail_connect.set(true);

        let resp = run(&h, "GET", "/api/x").await;
        assert_eq!(resp.status, 503);
        assert_eq!(header(&resp, "X-Error-Code"), Some("CONNECTION_ERROR"));
        assert!(header(&resp, "X-Request-ID").is_some());

        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["error"]["code"], "CONNECTION_ERROR");
        assert_eq!(body["error"]["retryable"], true);
    });
}

#[test]
fn circuit_opens_after_repeated_failures_and_fast_fails() {
    make_rt().block_on(async {
        let mut cfg = base_config();
        cfg["circuit_breaker"] = serde_json::json!({
            "failure_threshold": 2, "window_size": 2,
            "success_threshold": 1, "open_timeout_ms": 60000
        });
        let h = harness(cfg);
        h.fail_connect.set(true);

        // One request = 2 attempts (retries: 1), filling the window.
        let resp = run(&h, "GET", "/api/x").await;
        assert_eq!(resp.status, 503);
        assert_eq!(header(&resp, "X-Error-Code"), Some("CONNECTION_ERROR"));

        // Circuit is now open: rejection without touching the connector.
        h.fail_connect.set(false);
        let resp = run(&h, "GET", "/api/x").await;
        assert_eq!(resp.status, 503);
        assert_eq!(header(&resp, "X-Error-Code"), Some("CIRCUIT_OPEN"));
        assert_eq!(h.connects.get(), 0);

        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["error"]["code"], "CIRCUIT_OPEN");
        assert_eq!(body["error"]["retryable"], false);
    });
}

#[test]
fn cached_route_serves_second_request_from_cache() {
    make_rt().block_on(async {
        let mut cfg = base_config();
        cfg["routes"] = serde_json::json!([
            { "id": "api", "path": "/api/*", "upstream_id": "backend",
              "cache": { "ttl_secs": 60 } }
        ]);
        let h = harness(cfg);

        let first = run(&h, "GET", "/api/item").await;
        assert_eq!(first.status, 200);
        assert_eq!(h.connects.get(), 1);

        let second = run(&h, "GET", "/api/item").await;
        assert_eq!(second.status, 200);
        assert_eq!(&second.body[..], b"ok");
        assert_eq!(header(&second, "x-cache"), Some("HIT"));
        assert_eq!(h.connects.get(), 1, "cache hit must not dispatch upstream");

        // A different target misses.
        let third = run(&h, "GET", "/api/other").await;
        assert_eq!(third.status, 200);
        assert_eq!(h.connects.get(), 2);
    });
}

#[test]
fn conditional_request_on_cached_entry_returns_304() {
    make_rt().block_on(async {
        let mut cfg = base_config();
        cfg["routes"] = serde_json::json!([
            { "id": "api", "path": "/api/*", "upstream_id": "backend",
              "cache": { "ttl_secs": 60 } }
        ]);
        let h = harness(cfg);

        let first = run(&h, "GET", "/api/item").await;
        assert_eq!(first.status, 200);

        // Second hit exposes the etag; replay it as If-None-Match.
        let second = run(&h, "GET", "/api/item").await;
        let etag = header(&second, "etag").expect("cached response has etag").to_string();

        let third = run_with_headers(&h, "GET", "/api/item", &[("if-none-match", &etag)]).await;
        assert_eq!(third.status, 304);
        assert!(third.body.is_empty());
    });
}

#[test]
fn unhealthy_pinned_upstream_yields_503() {
    make_rt().block_on(async {
        let h = harness(base_config());

        // Flip the backend unhealthy through the health table.
        h.shared.health.register("backend");
        for _ in 0..3 {
            h.shared.health.apply_probe(
                "backend",
                false,
                None,
                2,
                3,
                std::time::Duration::ZERO,
            );
        }
        assert!(!h.shared.health.is_healthy("backend"));

        let resp = run(&h, "GET", "/api/x").await;
        assert_eq!(resp.status, 503);
        assert_eq!(header(&resp, "X-Error-Code"), Some("CONNECTION_ERROR"));
        assert_eq!(h.connects.get(), 0);
    });
}

#[test]
fn builtin_health_and_metrics_endpoints() {
    make_rt().block_on(async {
        let h = harness(base_config());

        let resp = run(&h, "GET", "/health").await;
        assert_eq!(resp.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["uptime"].is_u64());

        // Drive one request so the snapshot has data.
        let _ = run(&h, "GET", "/api/x").await;

        let resp = run(&h, "GET", "/metrics").await;
        assert_eq!(resp.status, 200);
        let snap: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert!(snap["requests"].as_u64().unwrap() >= 1);
        assert!(snap["latency_us"]["p99"].is_u64());
    });
}

#[test]
fn post_requests_bypass_cache() {
    make_rt().block_on(async {
        let mut cfg = base_config();
        cfg["routes"] = serde_json::json!([
            { "id": "api", "path": "/api/*", "upstream_id": "backend",
              "cache": { "ttl_secs": 60 } }
        ]);
        let h = harness(cfg);

        let _ = run(&h, "POST", "/api/item").await;
        let _ = run(&h, "POST", "/api/item").await;
        assert_eq!(h.connects.get(), 2, "POST must never be served from cache");
    });
}

#[test]
fn upstream_5xx_passes_through_and_counts_as_failure() {
    make_rt().block_on(async {
        let h = harness(base_config());
        h.responses.borrow_mut().push_back(
            b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\nconnection: close\r\n\r\noops"
                .to_vec(),
        );

        let resp = run(&h, "GET", "/api/x").await;
        assert_eq!(resp.status, 500, "5xx bodies pass through unchanged");
        assert_eq!(&resp.body[..], b"oops");
    });
}
