//! Minimal raw HTTP/1.1 client used to probe a candidate proxy directly
//! over a `TcpStream`, mirroring the low-level request/response handling
//! the forwarding side of this codebase uses (connect, write the request
//! line by hand, read until the peer closes, parse with `httparse`)
//! instead of pulling in a full HTTP client stack for a handful of probe
//! requests per candidate. HTTPS probes additionally tunnel through the
//! candidate with `CONNECT` and layer TLS over the tunnel with
//! `native-tls`/`tokio-native-tls` before the same hand-rolled
//! request/response handling takes over.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsConnector;

use crate::utils::error::{ProxyError, ProxyResult};

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// Default header set for the scraper, matching the reference crawler's
/// fingerprint: a realistic desktop browser plus a fixed `Accept-Language`.
pub fn default_scraper_headers() -> Vec<(String, String)> {
    vec![
        ("Connection".to_string(), "keep-alive".to_string()),
        (
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        ),
        ("User-Agent".to_string(), random_useragent().to_string()),
        ("Accept-Encoding".to_string(), "identity".to_string()),
        ("Accept-Language".to_string(), "zh-CN,zh;q=0.8".to_string()),
    ]
}

pub fn random_useragent() -> &'static str {
    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..DESKTOP_USER_AGENTS.len());
    DESKTOP_USER_AGENTS[idx]
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Build a GET request with an absolute-form request line, as a proxy
/// expects for a plain HTTP request.
pub fn build_get(absolute_url: &str, host: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut req = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", absolute_url, host);
    for (k, v) in headers {
        req.push_str(&format!("{}: {}\r\n", k, v));
    }
    req.push_str("Connection: close\r\n\r\n");
    req.into_bytes()
}

/// Build a GET request with an origin-form request line (path only), as
/// used once a TLS tunnel to the target host is already established — the
/// request no longer travels through the proxy's plain-HTTP forwarding, so
/// it looks like any direct client request.
pub fn build_get_origin_form(path_and_query: &str, host: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut req = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path_and_query, host);
    for (k, v) in headers {
        req.push_str(&format!("{}: {}\r\n", k, v));
    }
    req.push_str("Connection: close\r\n\r\n");
    req.into_bytes()
}

/// Build a POST request carrying a urlencoded form body.
pub fn build_post_form(absolute_url: &str, host: &str, form_body: &str) -> Vec<u8> {
    let mut req = format!("POST {} HTTP/1.1\r\nHost: {}\r\n", absolute_url, host);
    req.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
    req.push_str(&format!("Content-Length: {}\r\n", form_body.len()));
    req.push_str("Connection: close\r\n\r\n");
    req.push_str(form_body);
    req.into_bytes()
}

/// Send `request` over a fresh TCP connection to `proxy_addr` and collect
/// the full response. Used for plain-HTTP probes, where the candidate
/// proxy is contacted directly and handed an absolute-form request line.
pub async fn send_via_proxy(
    proxy_addr: &str,
    request: &[u8],
    request_timeout: Duration,
) -> ProxyResult<RawResponse> {
    let fut = async {
        let mut stream = TcpStream::connect(proxy_addr).await?;
        stream.write_all(request).await?;
        let raw = read_to_close(&mut stream, request_timeout).await?;
        parse_response(&raw)
    };
    match timeout(request_timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(ProxyError::Timeout),
    }
}

/// Send an unproxied request straight to `host:port`. Used for the
/// origin-IP bootstrap, which must bypass the candidate pool entirely.
pub async fn send_direct(
    host: &str,
    port: u16,
    request: &[u8],
    request_timeout: Duration,
) -> ProxyResult<RawResponse> {
    send_via_proxy(&format!("{}:{}", host, port), request, request_timeout).await
}

/// Probe a candidate proxy over HTTPS: open a `CONNECT target_host:443`
/// tunnel through the proxy, perform a TLS handshake over that tunnel, then
/// send `request` (origin-form, see `build_get_origin_form`) and collect the
/// response — the same round trip a browser makes through an HTTPS-capable
/// forward proxy.
pub async fn send_via_proxy_tls(
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
    request: &[u8],
    request_timeout: Duration,
) -> ProxyResult<RawResponse> {
    let fut = async {
        let mut stream = TcpStream::connect(proxy_addr).await?;
        connect_tunnel(&mut stream, target_host, target_port, request_timeout).await?;

        let native_connector = native_tls::TlsConnector::new().map_err(|e| ProxyError::Tls(e.to_string()))?;
        let connector = TlsConnector::from(native_connector);
        let mut tls_stream = connector
            .connect(target_host, stream)
            .await
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        tls_stream.write_all(request).await?;
        let raw = read_to_close(&mut tls_stream, request_timeout).await?;
        parse_response(&raw)
    };
    match timeout(request_timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(ProxyError::Timeout),
    }
}

/// Issue `CONNECT host:port` on an already-open TCP stream to the proxy and
/// wait for the `200` that opens the tunnel; any other status or a
/// malformed/absent response line is treated as the proxy refusing HTTPS.
async fn connect_tunnel(stream: &mut TcpStream, host: &str, port: u16, budget: Duration) -> ProxyResult<()> {
    let req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;

    let deadline = tokio::time::Instant::now() + budget;
    let mut data = Vec::new();
    loop {
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(ProxyError::Timeout);
        }
        let mut buf = [0u8; 1024];
        let n = timeout(remaining, stream.read(&mut buf))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        if n == 0 {
            return Err(ProxyError::Http("proxy closed connection during CONNECT".to_string()));
        }
        data.extend_from_slice(&buf[..n]);
    }

    let mut headers_buf = [httparse::EMPTY_HEADER; 16];
    let mut resp = httparse::Response::new(&mut headers_buf);
    resp.parse(&data)
        .map_err(|e| ProxyError::Http(format!("malformed CONNECT response: {}", e)))?;
    match resp.code {
        Some(200) => Ok(()),
        Some(code) => Err(ProxyError::Http(format!("CONNECT rejected with status {}", code))),
        None => Err(ProxyError::Http("CONNECT response missing status line".to_string())),
    }
}

async fn read_to_close<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, budget: Duration) -> ProxyResult<Vec<u8>> {
    let mut data = Vec::new();
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let mut buf = [0u8; 4096];
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => data.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(ProxyError::Network(e)),
            Err(_) => break,
        }
    }
    Ok(data)
}

fn parse_response(raw: &[u8]) -> ProxyResult<RawResponse> {
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers_buf);
    let parsed = resp
        .parse(raw)
        .map_err(|e| ProxyError::Http(format!("malformed response: {}", e)))?;
    let body_offset = match parsed {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(ProxyError::Http("incomplete response".to_string()))
        }
    };
    let status = resp.code.ok_or_else(|| ProxyError::Http("missing status code".to_string()))?;
    let headers = resp
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect();
    Ok(RawResponse {
        status,
        headers,
        body: raw[body_offset..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nVia: 1.1 proxy\r\n\r\n{\"ok\":true}";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.is_success());
        assert_eq!(resp.header("via"), Some("1.1 proxy"));
        assert_eq!(resp.body, b"{\"ok\":true}");
    }

    #[test]
    fn build_get_uses_absolute_form() {
        let req = build_get("http://httpbin.org/get?seed=1", "httpbin.org", &[]);
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("GET http://httpbin.org/get?seed=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: httpbin.org\r\n"));
    }

    #[test]
    fn build_get_origin_form_uses_path_only() {
        let req = build_get_origin_form("/get?seed=1", "httpbin.org", &[]);
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("GET /get?seed=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: httpbin.org\r\n"));
    }
}
