use crate::dispatch::{ProxyStream, build_client_response};
use crate::pool::Connector;
use crate::proxy::{Gateway, ParsedRequest};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use pylon_core::error::GatewayError;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

const RESP_400: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const RESP_431: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Handle one client connection (HTTP/1.1 with keep-alive).
///
/// All buffers are allocated once and reused across keep-alive requests;
/// header parsing is zero-copy (`httparse` refs into the accumulation
/// buffer). Pipelined bytes left after a request are preserved for the
/// next iteration.
pub async fn handle_connection<C>(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    gateway: Rc<Gateway<C>>,
) -> anyhow::Result<()>
where
    C: Connector + 'static,
    C::Conn: ProxyStream + 'static,
{
    let client_ip = peer_addr.ip().to_string();
    gateway.connection_opened();
    let result = serve_requests(&mut client, &client_ip, &gateway).await;
    gateway.connection_closed();
    result
}

async fn serve_requests<C>(
    client: &mut TcpStream,
    client_ip: &str,
    gateway: &Rc<Gateway<C>>,
) -> anyhow::Result<()>
where
    C: Connector + 'static,
    C::Conn: ProxyStream + 'static,
{
    let server = gateway.server_config().clone();
    let idle_timeout = Duration::from_millis(server.keep_alive_timeout_ms);
    let body_timeout = Duration::from_millis(server.request_timeout_ms);

    let mut acc: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut read_buf = vec![0u8; 16 * 1024];
    let mut resp_buf: Vec<u8> = Vec::with_capacity(4 * 1024);

    'requests: loop {
        // ── Phase 1: accumulate a complete header block ──
        let head = loop {
            if !acc.is_empty() {
                let mut headers_raw = [httparse::EMPTY_HEADER; 64];
                let mut req = httparse::Request::new(&mut headers_raw);
                match req.parse(&acc) {
                    Ok(httparse::Status::Complete(header_len)) => {
                        let mut content_length = 0usize;
                        for h in req.headers.iter() {
                            if h.name.is_empty() {
                                break;
                            }
                            if h.name.eq_ignore_ascii_case("content-length") {
                                content_length = std::str::from_utf8(h.value)
                                    .ok()
                                    .and_then(|s| s.trim().parse().ok())
                                    .unwrap_or(0);
                            }
                        }
                        break (header_len, content_length);
                    }
                    Ok(httparse::Status::Partial) => {
                        if acc.len() > server.max_header_size {
                            let (res, _) = client.write_all(RESP_431.to_vec()).await;
                            res?;
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "HTTP parse error");
                        let (res, _) = client.write_all(RESP_400.to_vec()).await;
                        res?;
                        return Ok(());
                    }
                }
            }

            // Idle keep-alive timeout applies while waiting for the next
            // request to start.
            let read = monoio::time::timeout(idle_timeout, client.read(read_buf));
            let (res, returned) = match read.await {
                Ok(r) => r,
                Err(_) => {
                    debug!("Keep-alive idle timeout, closing");
                    return Ok(());
                }
            };
            read_buf = returned;
            let n = match res {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(e.into()),
            };
            acc.extend_from_slice(&read_buf[..n]);
        };
        let (header_len, content_length) = head;

        // ── Phase 2: body limits + remaining body bytes ──
        if content_length > server.max_body_size {
            let err = GatewayError::BodyTooLarge {
                limit: server.max_body_size,
            };
            write_error(client, &mut resp_buf, &err).await?;
            return Ok(());
        }
        while acc.len() < header_len + content_length {
            let read = monoio::time::timeout(body_timeout, client.read(read_buf));
            let (res, returned) = match read.await {
                Ok(r) => r,
                Err(_) => {
                    let err = GatewayError::BodyTimeout {
                        ms: body_timeout.as_millis() as u64,
                    };
                    write_error(client, &mut resp_buf, &err).await?;
                    return Ok(());
                }
            };
            read_buf = returned;
            let n = match res {
                Ok(0) => {
                    let err = GatewayError::BodyMalformed("truncated body".into());
                    write_error(client, &mut resp_buf, &err).await?;
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => return Err(e.into()),
            };
            acc.extend_from_slice(&read_buf[..n]);
        }
        let request_bytes = header_len + content_length;

        // ── Phase 3: re-parse for borrowed views, then run the pipeline ──
        let (response, inflight, keep_alive) = {
            let mut headers_raw = [httparse::EMPTY_HEADER; 64];
            let mut req = httparse::Request::new(&mut headers_raw);
            let parsed = req.parse(&acc[..request_bytes]);
            debug_assert!(matches!(parsed, Ok(httparse::Status::Complete(_))));

            // Methods are matched case-insensitively at the wire
            // boundary only; routing itself compares bytes.
            let raw_method = req.method.unwrap_or("GET");
            let normalized_method;
            let method = if raw_method.bytes().all(|b| b.is_ascii_uppercase()) {
                raw_method
            } else {
                normalized_method = raw_method.to_ascii_uppercase();
                &normalized_method
            };
            let target = req.path.unwrap_or("/");

            let mut headers: Vec<(&str, &str)> = Vec::with_capacity(16);
            let mut keep_alive = server.keep_alive && req.version == Some(1);
            for h in req.headers.iter() {
                if h.name.is_empty() {
                    break;
                }
                let value = std::str::from_utf8(h.value).unwrap_or("");
                headers.push((h.name, value));
                if h.name.eq_ignore_ascii_case("connection") {
                    if value.eq_ignore_ascii_case("close") {
                        keep_alive = false;
                    } else if value.eq_ignore_ascii_case("keep-alive") {
                        keep_alive = server.keep_alive;
                    }
                }
            }

            let request = ParsedRequest {
                method,
                target,
                headers: &headers,
                body: &acc[header_len..request_bytes],
                client_ip,
            };
            let (response, inflight) = gateway.handle(request).await;
            (response, inflight, keep_alive)
        };

        // ── Write the response ──
        build_client_response(
            &mut resp_buf,
            response.status,
            &response.headers,
            &response.body,
            keep_alive,
        );
        let out_len = resp_buf.len() as u64;
        let data = resp_buf.clone();
        let (res, _) = client.write_all(data).await;
        let write_ok = res.is_ok();

        // ── Post-write half of the lifecycle ──
        if let Some(inflight) = inflight {
            gateway
                .finish(inflight, response.status, request_bytes as u64, out_len)
                .await;
        }
        if !write_ok {
            return Ok(());
        }

        // Preserve pipelined bytes for the next request.
        acc.drain(..request_bytes);
        if !keep_alive {
            return Ok(());
        }
        continue 'requests;
    }
}

async fn write_error(
    client: &mut TcpStream,
    resp_buf: &mut Vec<u8>,
    err: &GatewayError,
) -> anyhow::Result<()> {
    let envelope = err.to_envelope(None, None);
    let body = envelope.to_json_body();
    let headers = vec![
        ("content-type".to_string(), "application/json".to_string()),
        ("X-Error-Code".to_string(), err.code().to_string()),
    ];
    build_client_response(resp_buf, err.status_code(), &headers, &body, false);
    let data = resp_buf.clone();
    let (res, _) = client.write_all(data).await;
    res?;
    Ok(())
}
