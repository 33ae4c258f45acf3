use crate::pool::Connector;
use bytes::Bytes;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use pylon_core::error::GatewayError;
use std::net::SocketAddr;

/// Byte-level transport seam. Production is `monoio::net::TcpStream`;
/// tests script reads and capture writes.
pub trait ProxyStream {
    fn read_into(
        &mut self,
        buf: Vec<u8>,
    ) -> impl Future<Output = (std::io::Result<usize>, Vec<u8>)>;

    fn write_all_from(
        &mut self,
        buf: Vec<u8>,
    ) -> impl Future<Output = (std::io::Result<()>, Vec<u8>)>;
}

impl ProxyStream for TcpStream {
    async fn read_into(&mut self, buf: Vec<u8>) -> (std::io::Result<usize>, Vec<u8>) {
        AsyncReadRent::read(self, buf).await
    }

    async fn write_all_from(&mut self, buf: Vec<u8>) -> (std::io::Result<()>, Vec<u8>) {
        let (res, buf) = AsyncWriteRentExt::write_all(self, buf).await;
        (res.map(|_| ()), buf)
    }
}

// ── TCP connector ─────────────────────────────────────────────

/// Resolve an addr string (e.g. `"localhost:3001"`) to socket addresses,
/// IPv4 first.
///
/// The blocking std resolution is acceptable here: it only runs when the
/// connection pool opens a new connection, never on the steady-state
/// reuse path. IPv4 sorts first because `localhost` commonly resolves to
/// `::1` before `127.0.0.1` while most upstreams listen on IPv4 only.
fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    let mut v4: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    let v6: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv6()).collect();
    v4.extend(v6);
    v4
}

/// Opens keep-alive TCP connections to upstreams, trying every resolved
/// candidate in order.
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpStream;

    async fn connect(&self, addr: &str) -> std::io::Result<TcpStream> {
        let candidates = resolve_addrs(addr);
        if candidates.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("resolve failed for {}", addr),
            ));
        }
        let mut last_err = None;
        for sa in &candidates {
            match TcpStream::connect(*sa).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(addr = %addr, resolved = %sa, "Upstream connected");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, resolved = %sa, error = %e, "Upstream candidate failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no candidates")
        }))
    }
}

// ── Wire builders ─────────────────────────────────────────────

/// Build the upstream request into `buf`. Zero-copy from `&str` header
/// refs; hop-by-hop headers are dropped and `X-Forwarded-For` is merged
/// with the client address.
pub fn build_upstream_request(
    buf: &mut Vec<u8>,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
    client_ip: &str,
) {
    buf.clear();
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    let mut forwarded_for: Option<&str> = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("upgrade")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("x-forwarded-for") {
            forwarded_for = Some(value);
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"x-forwarded-for: ");
    if let Some(prior) = forwarded_for {
        buf.extend_from_slice(prior.as_bytes());
        buf.extend_from_slice(b", ");
    }
    buf.extend_from_slice(client_ip.as_bytes());
    buf.extend_from_slice(b"\r\n");

    buf.extend_from_slice(b"connection: keep-alive\r\n");
    if !body.is_empty() {
        buf.extend_from_slice(b"content-length: ");
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    if !body.is_empty() {
        buf.extend_from_slice(body);
    }
}

/// Build a client-facing HTTP/1.1 response into `buf`.
pub fn build_client_response(
    buf: &mut Vec<u8>,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
    keep_alive: bool,
) {
    buf.clear();
    buf.extend_from_slice(b"HTTP/1.1 ");
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(itoa_buf.format(status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status_text(status).as_bytes());
    buf.extend_from_slice(b"\r\ncontent-length: ");
    buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    buf.extend_from_slice(b"\r\nconnection: ");
    buf.extend_from_slice(if keep_alive { b"keep-alive" as &[u8] } else { b"close" });
    buf.extend_from_slice(b"\r\n");
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("content-length")
            || k.eq_ignore_ascii_case("connection")
            || k.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

// ── Upstream response reading ─────────────────────────────────

/// Fully-buffered upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Whether the upstream connection may be pooled again.
    pub keep_alive: bool,
}

/// Send `request` and read one complete response.
///
/// Responses are buffered (bounded by `max_response_bytes`) so the
/// post-handler hooks and the response cache can see the whole body.
pub async fn forward<S: ProxyStream>(
    stream: &mut S,
    request: &[u8],
    head_request: bool,
    max_response_bytes: usize,
) -> Result<UpstreamResponse, GatewayError> {
    let (res, _) = stream.write_all_from(request.to_vec()).await;
    res.map_err(|e| GatewayError::Upstream(format!("write failed: {}", e)))?;

    let mut acc: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = vec![0u8; 16 * 1024];

    // Read until the header block is complete.
    let head = loop {
        let (res, returned) = stream.read_into(chunk).await;
        chunk = returned;
        let n = res.map_err(|e| GatewayError::Upstream(format!("read failed: {}", e)))?;
        if n == 0 {
            return Err(GatewayError::Upstream(
                "upstream closed connection without response".into(),
            ));
        }
        acc.extend_from_slice(&chunk[..n]);
        if acc.len() > max_response_bytes {
            return Err(GatewayError::Upstream("response too large".into()));
        }

        let mut headers_raw = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut headers_raw);
        match resp.parse(&acc) {
            Ok(httparse::Status::Complete(header_len)) => {
                let status = resp.code.unwrap_or(502);
                let mut headers = Vec::with_capacity(resp.headers.len());
                let mut content_length: Option<usize> = None;
                let mut keep_alive = true;
                let mut chunked = false;
                for h in resp.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    let value = std::str::from_utf8(h.value).unwrap_or("");
                    if h.name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().ok();
                    } else if h.name.eq_ignore_ascii_case("connection") {
                        keep_alive = !value.eq_ignore_ascii_case("close");
                    } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                        chunked = value.to_ascii_lowercase().contains("chunked");
                    }
                    headers.push((h.name.to_string(), value.to_string()));
                }
                break Head {
                    status,
                    headers,
                    content_length,
                    keep_alive,
                    chunked,
                    header_len,
                };
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => {
                return Err(GatewayError::Upstream(format!("bad response: {}", e)));
            }
        }
    };

    let mut body = acc.split_off(head.header_len);
    let mut keep_alive = head.keep_alive;

    let bodyless = head_request
        || head.status == 204
        || head.status == 304
        || (100..200).contains(&head.status);

    if bodyless {
        body.clear();
    } else if let Some(cl) = head.content_length {
        if cl > max_response_bytes {
            return Err(GatewayError::Upstream("response too large".into()));
        }
        while body.len() < cl {
            let (res, returned) = stream.read_into(chunk).await;
            chunk = returned;
            let n = res.map_err(|e| GatewayError::Upstream(format!("read failed: {}", e)))?;
            if n == 0 {
                return Err(GatewayError::Upstream("truncated response body".into()));
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(cl);
    } else {
        // No content-length: chunked or close-delimited. Either way the
        // simple path is to read to EOF and retire the connection.
        keep_alive = false;
        loop {
            let (res, returned) = stream.read_into(chunk).await;
            chunk = returned;
            let n = res.map_err(|e| GatewayError::Upstream(format!("read failed: {}", e)))?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
            if body.len() > max_response_bytes {
                return Err(GatewayError::Upstream("response too large".into()));
            }
        }
        if head.chunked {
            body = decode_chunked(&body)?;
        }
    }

    Ok(UpstreamResponse {
        status: head.status,
        headers: head.headers,
        body: Bytes::from(body),
        keep_alive,
    })
}

struct Head {
    status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    keep_alive: bool,
    chunked: bool,
    header_len: usize,
}

/// Minimal chunked-transfer decoder for fully-buffered bodies.
fn decode_chunked(raw: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut pos = 0usize;
    loop {
        let line_end = find_crlf(&raw[pos..])
            .ok_or_else(|| GatewayError::Upstream("bad chunked encoding".into()))?;
        let size_str = std::str::from_utf8(&raw[pos..pos + line_end])
            .map_err(|_| GatewayError::Upstream("bad chunked encoding".into()))?;
        let size = usize::from_str_radix(size_str.trim().split(';').next().unwrap_or(""), 16)
            .map_err(|_| GatewayError::Upstream("bad chunk size".into()))?;
        pos += line_end + 2;
        if size == 0 {
            return Ok(out);
        }
        if pos + size > raw.len() {
            return Err(GatewayError::Upstream("truncated chunk".into()));
        }
        out.extend_from_slice(&raw[pos..pos + size]);
        pos += size + 2; // skip trailing CRLF
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeStream {
        reads: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl FakeStream {
        fn new(reads: Vec<&[u8]>) -> Self {
            Self {
                reads: reads.into_iter().map(|r| r.to_vec()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl ProxyStream for FakeStream {
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

    fn make_rt() -> monoio::Runtime<monoio::LegacyDriver> {
        monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
            .build()
            .expect("monoio runtime build failed")
    }

    // ── builders ─────────────────────────────────────────────

    #[test]
    fn test_build_upstream_request_basic() {
        let mut buf = Vec::new();
        build_upstream_request(&mut buf, "GET", "/api", &[("host", "h")], b"", "1.2.3.4");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("GET /api HTTP/1.1\r\n"));
        assert!(text.contains("host: h\r\n"));
        assert!(text.contains("x-forwarded-for: 1.2.3.4\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(!text.contains("content-length:"));
    }

    #[test]
    fn test_build_upstream_request_filters_hop_by_hop() {
        let mut buf = Vec::new();
        let headers = [
            ("Connection", "close"),
            ("Keep-Alive", "timeout=5"),
            ("Transfer-Encoding", "chunked"),
            ("Upgrade", "websocket"),
            ("Accept", "*/*"),
        ];
        build_upstream_request(&mut buf, "POST", "/", &headers, b"xy", "9.9.9.9");
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("timeout=5"));
        assert!(!text.contains("chunked"));
        assert!(!text.contains("websocket"));
        assert!(text.contains("accept: */*\r\n".to_owned().as_str()) || text.contains("Accept: */*\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.ends_with("xy"));
    }

    #[test]
    fn test_build_upstream_request_merges_forwarded_for() {
        let mut buf = Vec::new();
        build_upstream_request(
            &mut buf,
            "GET",
            "/",
            &[("X-Forwarded-For", "7.7.7.7")],
            b"",
            "8.8.8.8",
        );
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("x-forwarded-for: 7.7.7.7, 8.8.8.8\r\n"));
    }

    #[test]
    fn test_build_client_response_shape() {
        let mut buf = Vec::new();
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        build_client_response(&mut buf, 429, &headers, b"{}", true);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.contains("content-type: application/json\r\n"));
        assert!(text.ends_with("{}"));
    }

    #[test]
    fn test_build_client_response_close() {
        let mut buf = Vec::new();
        build_client_response(&mut buf, 200, &[], b"hi", false);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("connection: close\r\n"));
    }

    #[test]
    fn test_status_text_unknown() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(431), "Request Header Fields Too Large");
        assert_eq!(status_text(999), "Unknown");
    }

    // ── forward ──────────────────────────────────────────────

    #[test]
    fn test_forward_simple_response() {
        make_rt().block_on(async {
            let mut stream = FakeStream::new(vec![
                b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\nhello",
            ]);
            let resp = forward(&mut stream, b"GET / HTTP/1.1\r\n\r\n", false, 1 << 20)
                .await
                .unwrap();
            assert_eq!(resp.status, 200);
            assert_eq!(&resp.body[..], b"hello");
            assert!(resp.keep_alive);
            assert!(
                resp.headers
                    .iter()
                    .any(|(k, v)| k == "content-type" && v == "text/plain")
            );
            assert!(stream.written.starts_with(b"GET / HTTP/1.1"));
        });
    }

    #[test]
    fn test_forward_body_split_across_reads() {
        make_rt().block_on(async {
            let mut stream = FakeStream::new(vec![
                b"HTTP/1.1 200 OK\r\ncontent-le",
                b"ngth: 10\r\n\r\n12345",
                b"67890",
            ]);
            let resp = forward(&mut stream, b"x", false, 1 << 20).await.unwrap();
            assert_eq!(&resp.body[..], b"1234567890");
        });
    }

    #[test]
    fn test_forward_connection_close_not_pooled() {
        make_rt().block_on(async {
            let mut stream = FakeStream::new(vec![
                b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok",
            ]);
            let resp = forward(&mut stream, b"x", false, 1 << 20).await.unwrap();
            assert!(!resp.keep_alive);
        });
    }

    #[test]
    fn test_forward_immediate_close_is_upstream_error() {
        make_rt().block_on(async {
            let mut stream = FakeStream::new(vec![]);
            let err = forward(&mut stream, b"x", false, 1 << 20).await.unwrap_err();
            assert!(matches!(err, GatewayError::Upstream(_)));
            assert_eq!(err.status_code(), 502);
            assert!(err.retryable());
        });
    }

    #[test]
    fn test_forward_no_content_length_reads_to_eof() {
        make_rt().block_on(async {
            let mut stream =
                FakeStream::new(vec![b"HTTP/1.1 200 OK\r\n\r\npartial", b" tail"]);
            let resp = forward(&mut stream, b"x", false, 1 << 20).await.unwrap();
            assert_eq!(&resp.body[..], b"partial tail");
            assert!(!resp.keep_alive, "close-delimited bodies retire the conn");
        });
    }

    #[test]
    fn test_forward_head_request_has_no_body() {
        make_rt().block_on(async {
            let mut stream = FakeStream::new(vec![
                b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n",
            ]);
            let resp = forward(&mut stream, b"x", true, 1 << 20).await.unwrap();
            assert!(resp.body.is_empty());
            assert!(resp.keep_alive);
        });
    }

    #[test]
    fn test_forward_oversized_body_rejected() {
        make_rt().block_on(async {
            let mut stream = FakeStream::new(vec![
                b"HTTP/1.1 200 OK\r\ncontent-length: 1000000\r\n\r\n",
            ]);
            let err = forward(&mut stream, b"x", false, 1024).await.unwrap_err();
            assert!(matches!(err, GatewayError::Upstream(_)));
        });
    }

    #[test]
    fn test_forward_chunked_decoding() {
        make_rt().block_on(async {
            let mut stream = FakeStream::new(vec![
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            ]);
            let resp = forward(&mut stream, b"x", false, 1 << 20).await.unwrap();
            assert_eq!(&resp.body[..], b"hello world");
        });
    }

    #[test]
    fn test_decode_chunked_errors_on_garbage() {
        assert!(decode_chunked(b"zz\r\nnope").is_err());
        assert!(decode_chunked(b"5\r\nhel").is_err());
    }
}
