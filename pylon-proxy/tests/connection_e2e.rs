//! End-to-end tests for `handle_connection` using a real monoio runtime
//! and real TCP sockets — no network mocking.
//!
//! These exercise the I/O loop in connection.rs that the scripted
//! pipeline tests cannot: wire parsing, keep-alive, and the proxied
//! round trip through an actual backend socket.

use pylon_core::config::GatewayConfig;
use pylon_core::router::Router;
use pylon_plugin::registry::PluginRegistry;
use pylon_proxy::connection::handle_connection;
use pylon_proxy::dispatch::TcpConnector;
use pylon_proxy::proxy::{Gateway, GatewayParts};
use pylon_proxy::worker::SharedState;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use std::rc::Rc;
use std::sync::Arc;

fn make_rt() -> monoio::Runtime<monoio::time::TimeDriver<monoio::LegacyDriver>> {
    monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
        .enable_timer()
        .build()
        .expect("monoio runtime build failed")
}

/// Spawn a backend that answers every request with a fixed response.
async fn spawn_backend(response: &'static [u8]) -> u16 {
    let listener = monoio::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    monoio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            monoio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    let (res, returned) = stream.read(buf).await;
                    buf = returned;
                    match res {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    let (res, _) = stream.write_all(response.to_vec()).await;
                    if res.is_err() {
                        return;
                    }
                }
            });
        }
    });
    port
}

fn make_gateway(backend_port: u16) -> Rc<Gateway<TcpConnector>> {
    let config: GatewayConfig = serde_json::from_value(serde_json::json!({
        "upstreams": [
            { "id": "backend", "host": "127.0.0.1", "port": backend_port,
              "connect_timeout_ms": 500, "request_timeout_ms": 1000 }
        ],
        "routes": [
            { "id": "echo", "path": "/echo/*", "upstream_id": "backend" }
        ]
    }))
    .unwrap();
    let router = Router::build(config.routes.clone());
    let shared = SharedState::new(config, router, PluginRegistry::new());
    Gateway::new(GatewayParts {
        config: Arc::clone(&shared.config),
        router: Arc::clone(&shared.router),
        registry: Arc::clone(&shared.registry),
        metrics: Arc::clone(&shared.metrics),
        prometheus: Arc::clone(&shared.prometheus),
        health: Arc::clone(&shared.health),
        connector: TcpConnector,
    })
}

/// Accept one client connection and serve it through the gateway.
async fn spawn_proxy(gateway: Rc<Gateway<TcpConnector>>) -> std::net::SocketAddr {
    let listener = monoio::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    monoio::spawn(async move {
        if let Ok((stream, peer)) = listener.accept().await {
            let _ = handle_connection(stream, peer, gateway).await;
        }
    });
    addr
}

fn status_line(buf: &[u8]) -> &str {
    let s = std::str::from_utf8(buf).unwrap_or("");
    s.lines().next().unwrap_or("")
}

async fn roundtrip(addr: std::net::SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut client = monoio::net::TcpStream::connect(addr.to_string().as_str())
        .await
        .expect("connect to proxy");
    let (res, _) = client.write_all(request.to_vec()).await;
    res.unwrap();
    let mut out = Vec::new();
    let mut buf = vec![0u8; 8192];
    let (res, returned) = client.read(buf).await;
    buf = returned;
    let n = res.unwrap();
    out.extend_from_slice(&buf[..n]);
    out
}

#[test]
fn proxies_request_through_real_backend() {
    make_rt().block_on(async {
        let port = spawn_backend(
            b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 7\r\n\r\nbackend",
        )
        .await;
        let gateway = make_gateway(port);
        let addr = spawn_proxy(gateway).await;

        let resp = roundtrip(
            addr,
            b"GET /echo/hello HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(status_line(&resp), "HTTP/1.1 200 OK");
        let text = String::from_utf8_lossy(&resp);
        assert!(text.ends_with("backend"), "body must pass through: {}", text);
        assert!(text.contains("connection: close"));
    });
}

#[test]
fn unmatched_route_gets_404_without_backend() {
    make_rt().block_on(async {
        // No backend at all: the 404 path must not dial out.
        let gateway = make_gateway(1);
        let addr = spawn_proxy(gateway).await;

        let resp = roundtrip(
            addr,
            b"GET /nothing HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(status_line(&resp), "HTTP/1.1 404 Not Found");
        assert!(String::from_utf8_lossy(&resp).contains("no route matched"));
    });
}

#[test]
fn keep_alive_serves_two_requests_on_one_connection() {
    make_rt().block_on(async {
        let port = spawn_backend(
            b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 2\r\n\r\nok",
        )
        .await;
        let gateway = make_gateway(port);
        let addr = spawn_proxy(gateway).await;

        let mut client = monoio::net::TcpStream::connect(addr.to_string().as_str())
            .await
            .unwrap();

        for i in 0..2 {
            let (res, _) = client
                .write_all(b"GET /echo/a HTTP/1.1\r\nhost: x\r\n\r\n".to_vec())
                .await;
            res.unwrap();
            let buf = vec![0u8; 8192];
            let (res, buf) = client.read(buf).await;
            let n = res.unwrap();
            assert!(n > 0, "request {} got no response", i);
            let text = String::from_utf8_lossy(&buf[..n]);
            assert!(text.starts_with("HTTP/1.1 200 OK"), "request {}: {}", i, text);
            assert!(text.contains("connection: keep-alive"));
        }
    });
}

#[test]
fn malformed_request_gets_400() {
    make_rt().block_on(async {
        let gateway = make_gateway(1);
        let addr = spawn_proxy(gateway).await;

        let resp = roundtrip(addr, b"NOT AN HTTP REQUEST\r\n\r\n").await;
        assert_eq!(status_line(&resp), "HTTP/1.1 400 Bad Request");
    });
}

#[test]
fn builtin_health_endpoint_over_the_wire() {
    make_rt().block_on(async {
        let gateway = make_gateway(1);
        let addr = spawn_proxy(gateway).await;

        let resp = roundtrip(
            addr,
            b"GET /health HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(status_line(&resp), "HTTP/1.1 200 OK");
        assert!(String::from_utf8_lossy(&resp).contains("\"status\":\"ok\""));
    });
}
