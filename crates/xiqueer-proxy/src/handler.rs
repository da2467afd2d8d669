//! Per-connection request handling.
//!
//! Each accepted client sends exactly one request. `CONNECT` requests become
//! opaque tunnels; anything else is forwarded as plain HTTP with
//! `Connection: close`, and the completed exchange is handed to the capture
//! callback. Every failure before the response is relayed is answered with a
//! `502 Bad Gateway` and the connection is closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::tunnel;
use crate::upstream::UpstreamConnector;
use crate::wire::{read_message, Header, WireMessage};

/// Time allowed for the client to send its request.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the upstream to send its response.
pub const RESPONSE_READ_TIMEOUT: Duration = Duration::from_secs(12);

/// A completed plain-HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedExchange {
    /// Lower-cased upstream host.
    pub host: String,
    /// Path and query as forwarded.
    pub path: String,
    /// Request body, lossily decoded as UTF-8.
    pub request_body: String,
    /// Response body, lossily decoded as UTF-8.
    pub response_body: String,
}

/// Callback invoked once per completed plain-HTTP exchange.
pub type CaptureCallback = Arc<dyn Fn(&CapturedExchange) + Send + Sync>;

/// Where a plain-HTTP request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTarget {
    pub host: String,
    pub port: u16,
    pub path_with_query: String,
}

/// Resolves the request target into host, port and origin-form path.
///
/// Absolute `http`/`https` URIs carry their own authority. Anything else is
/// treated as origin-form and paired with the `Host` header.
pub fn normalize_target(target: &str, host_header: Option<&str>) -> NormalizedTarget {
    if let Some(absolute) = parse_absolute_uri(target) {
        return absolute;
    }

    let host_header = host_header.unwrap_or_default().trim();
    let (host, port) = match host_header.split_once(':') {
        Some((host, port)) => (host, port.trim().parse().unwrap_or(80)),
        None => (host_header, 80),
    };

    NormalizedTarget {
        host: host.trim().to_string(),
        port,
        path_with_query: target.to_string(),
    }
}

fn parse_absolute_uri(target: &str) -> Option<NormalizedTarget> {
    let (scheme, rest) = target.split_once("://")?;
    let default_port = if scheme.eq_ignore_ascii_case("https") {
        443
    } else if scheme.eq_ignore_ascii_case("http") {
        80
    } else {
        return None;
    };

    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);

    let (host, port) = split_host_port(authority, default_port);
    if host.is_empty() {
        return None;
    }

    let tail = tail.split('#').next().unwrap_or_default();
    let path_with_query = if tail.starts_with('/') {
        tail.to_string()
    } else {
        format!("/{}", tail)
    };

    Some(NormalizedTarget {
        host,
        port,
        path_with_query,
    })
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    let authority = authority.trim();

    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }

    match authority.rsplit_once(':') {
        // A bare IPv6 literal has more than one colon and no port
        Some((host, port)) if !host.contains(':') => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (authority.to_string(), default_port),
    }
}

/// Shared per-connection settings.
#[derive(Clone)]
pub struct HandlerConfig {
    pub connector: UpstreamConnector,
    pub on_capture: Option<CaptureCallback>,
    pub request_timeout: Duration,
    pub response_timeout: Duration,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("connector", &self.connector)
            .field("on_capture", &self.on_capture.is_some())
            .field("request_timeout", &self.request_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

/// Serves one client connection to completion.
pub async fn handle_client(stream: TcpStream, config: Arc<HandlerConfig>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match tokio::time::timeout(config.request_timeout, read_message(&mut reader)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!("Request read failed: {}", e);
            bad_gateway(&mut write_half, "request read failed").await;
            return;
        }
        Err(_) => {
            debug!("Request read timed out");
            bad_gateway(&mut write_half, "request read failed").await;
            return;
        }
    };

    let RequestLine {
        method,
        target,
        version,
    } = match RequestLine::parse(&request.start_line) {
        Ok(line) => line,
        Err(e) => {
            warn!("{}", e);
            bad_gateway(&mut write_half, "invalid request line").await;
            return;
        }
    };
    info!("{} {} {}", method, target, version);

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(target, 443);
        if host.is_empty() {
            bad_gateway(&mut write_half, "host is empty").await;
            return;
        }
        open_tunnel(&config, reader, write_half, &host, port, version).await;
        return;
    }

    let target = normalize_target(target, request.header("Host"));
    if target.host.is_empty() {
        bad_gateway(&mut write_half, "host is empty").await;
        return;
    }

    let forwarded = rewrite_for_upstream(&request, method, &target, version);
    let response = match forward(&config, &target, &forwarded).await {
        Ok(response) => response,
        Err(reason) => {
            bad_gateway(&mut write_half, reason).await;
            return;
        }
    };

    let set_cookies = response.header_count("Set-Cookie");
    let cookie_len = request.header("Cookie").map_or(0, str::len);
    info!(
        "{} {}{} -> {:?} ({} bytes, {} Set-Cookie, request cookie {} bytes)",
        method,
        target.host,
        target.path_with_query,
        response.start_line,
        response.body.len(),
        set_cookies,
        cookie_len
    );

    if let Err(e) = write_half.write_all(&response.to_bytes()).await {
        debug!("Client went away before the response was written: {}", e);
        return;
    }
    let _ = write_half.flush().await;

    if let Some(callback) = &config.on_capture {
        let exchange = CapturedExchange {
            host: target.host.to_ascii_lowercase(),
            path: target.path_with_query,
            request_body: String::from_utf8_lossy(&request.body).into_owned(),
            response_body: String::from_utf8_lossy(&response.body).into_owned(),
        };
        deliver(callback.clone(), exchange).await;
    }
}

/// The three parts of a request line. Extra tokens after the version are
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestLine<'a> {
    method: &'a str,
    target: &'a str,
    version: &'a str,
}

impl<'a> RequestLine<'a> {
    fn parse(line: &'a str) -> Result<Self> {
        let mut parts = line.split(' ').filter(|p| !p.is_empty());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(version)) => Ok(Self {
                method,
                target,
                version,
            }),
            _ => Err(ProxyError::InvalidRequestLine(line.to_string())),
        }
    }
}

/// Builds the request sent upstream: origin-form target, no hop-by-hop
/// connection headers, and `Connection: close`.
fn rewrite_for_upstream(
    request: &WireMessage,
    method: &str,
    target: &NormalizedTarget,
    version: &str,
) -> WireMessage {
    let mut headers: Vec<Header> = request
        .headers
        .iter()
        .filter(|h| !h.is("Proxy-Connection") && !h.is("Connection"))
        .cloned()
        .collect();
    headers.push(Header::new("Connection", "close"));

    WireMessage::new(
        format!("{} {} {}", method, target.path_with_query, version),
        headers,
        request.body.clone(),
    )
}

/// Sends the request and reads one response; errors become a 502 reason.
async fn forward(
    config: &HandlerConfig,
    target: &NormalizedTarget,
    request: &WireMessage,
) -> std::result::Result<WireMessage, &'static str> {
    match exchange(config, target, request).await {
        Ok(Some(response)) => Ok(response),
        Ok(None) => {
            warn!("{}:{} sent no response", target.host, target.port);
            Err("upstream sent no response")
        }
        Err(ProxyError::Timeout(what)) => {
            warn!("{}:{} {} timed out", target.host, target.port, what);
            Err("upstream timed out")
        }
        Err(e) => {
            warn!("Forwarding to {}:{} failed: {}", target.host, target.port, e);
            Err("upstream request failed")
        }
    }
}

async fn exchange(
    config: &HandlerConfig,
    target: &NormalizedTarget,
    request: &WireMessage,
) -> Result<Option<WireMessage>> {
    let upstream = config.connector.connect(&target.host, target.port).await?;
    let (read_half, mut write_half) = upstream.into_split();

    write_half.write_all(&request.to_bytes()).await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half);
    tokio::time::timeout(config.response_timeout, read_message(&mut reader))
        .await
        .map_err(|_| ProxyError::Timeout("response read"))?
}

async fn open_tunnel(
    config: &HandlerConfig,
    client_reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    mut client_writer: tokio::net::tcp::OwnedWriteHalf,
    host: &str,
    port: u16,
    version: &str,
) {
    let upstream = match config.connector.connect(host, port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("CONNECT {}:{} failed: {}", host, port, e);
            bad_gateway(&mut client_writer, "CONNECT failed").await;
            return;
        }
    };

    let established = format!("{} 200 Connection Established\r\n\r\n", version);
    if let Err(e) = client_writer.write_all(established.as_bytes()).await {
        debug!("Client went away before the tunnel opened: {}", e);
        return;
    }

    info!("Tunnel open to {}:{}", host, port);
    let (upstream_reader, upstream_writer) = upstream.into_split();
    // The reader may already hold bytes the client sent right after the head
    let stats = tunnel::relay(client_reader, client_writer, upstream_reader, upstream_writer).await;
    debug!(
        "Tunnel to {}:{} closed ({} bytes up, {} bytes down)",
        host, port, stats.client_to_upstream, stats.upstream_to_client
    );
}

/// Runs the callback on the blocking pool so a panic stays contained.
async fn deliver(callback: CaptureCallback, exchange: CapturedExchange) {
    let host = exchange.host.clone();
    let result = tokio::task::spawn_blocking(move || callback(&exchange)).await;

    if let Err(e) = result {
        if e.is_panic() {
            error!("Capture callback panicked for {}", host);
        } else {
            debug!("Capture callback cancelled for {}: {}", host, e);
        }
    }
}

/// Body of a `502 Bad Gateway` answer.
pub fn bad_gateway_response(reason: &str) -> Vec<u8> {
    let body = format!("Bad Gateway: {}", reason);
    format!(
        "HTTP/1.1 502 Bad Gateway\r\n\
         Content-Type: text/plain; charset=UTF-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
    .into_bytes()
}

async fn bad_gateway<W>(writer: &mut W, reason: &str)
where
    W: AsyncWrite + Unpin,
{
    // The client may already be gone
    let _ = writer.write_all(&bad_gateway_response(reason)).await;
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_http_uri() {
        let target = normalize_target("http://jw.xxgc.edu.cn/jwweb//wap/x.aspx?a=1&b=2", None);
        assert_eq!(
            target,
            NormalizedTarget {
                host: "jw.xxgc.edu.cn".to_string(),
                port: 80,
                path_with_query: "/jwweb//wap/x.aspx?a=1&b=2".to_string(),
            }
        );
    }

    #[test]
    fn absolute_https_uri_defaults_to_443() {
        let target = normalize_target("HTTPS://example.com", Some("ignored:1"));
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        assert_eq!(target.path_with_query, "/");
    }

    #[test]
    fn absolute_uri_with_port_userinfo_and_fragment() {
        let target = normalize_target("http://user:pw@Example.com:8080?q=1#frag", None);
        assert_eq!(target.host, "Example.com");
        assert_eq!(target.port, 8080);
        assert_eq!(target.path_with_query, "/?q=1");
    }

    #[test]
    fn absolute_uri_with_ipv6_literal() {
        let target = normalize_target("http://[::1]:8000/a", None);
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8000);
        assert_eq!(target.path_with_query, "/a");
    }

    #[test]
    fn origin_form_uses_host_header() {
        let target = normalize_target("/a?b=c", Some("example.com:8081"));
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 8081);
        assert_eq!(target.path_with_query, "/a?b=c");

        let target = normalize_target("/a", Some(" example.com "));
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
    }

    #[test]
    fn non_http_scheme_falls_back_to_host_header() {
        let target = normalize_target("ftp://files.example.com/x", Some("h"));
        assert_eq!(target.host, "h");
        assert_eq!(target.path_with_query, "ftp://files.example.com/x");
    }

    #[test]
    fn missing_host_is_blank() {
        assert!(normalize_target("/a", None).host.is_empty());
        assert!(normalize_target("http:///a", None).host.is_empty());
    }

    #[test]
    fn connect_authorities() {
        assert_eq!(split_host_port("example.com:8443", 443), ("example.com".to_string(), 8443));
        assert_eq!(split_host_port("example.com", 443), ("example.com".to_string(), 443));
        assert_eq!(split_host_port("[2001:db8::1]:993", 443), ("2001:db8::1".to_string(), 993));
        assert_eq!(split_host_port("[2001:db8::1]", 443), ("2001:db8::1".to_string(), 443));
        assert_eq!(split_host_port("2001:db8::1", 443), ("2001:db8::1".to_string(), 443));
        assert_eq!(split_host_port(":443", 443), (String::new(), 443));
    }

    #[test]
    fn upstream_request_is_rewritten() {
        let request = WireMessage::new(
            "POST http://h/p?x=1 HTTP/1.1",
            vec![
                Header::new("Host", "h"),
                Header::new("Proxy-Connection", "keep-alive"),
                Header::new("connection", "keep-alive"),
                Header::new("Cookie", "a=b"),
            ],
            b"param=1".to_vec(),
        );
        let target = normalize_target("http://h/p?x=1", None);

        let forwarded = rewrite_for_upstream(&request, "POST", &target, "HTTP/1.1");
        assert_eq!(forwarded.start_line, "POST /p?x=1 HTTP/1.1");
        assert_eq!(
            forwarded.headers,
            vec![
                Header::new("Host", "h"),
                Header::new("Cookie", "a=b"),
                Header::new("Connection", "close"),
            ]
        );
        assert_eq!(forwarded.body, b"param=1");
    }

    #[test]
    fn request_line_parts() {
        let line = RequestLine::parse("GET  http://h/p HTTP/1.1").unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.target, "http://h/p");
        assert_eq!(line.version, "HTTP/1.1");
    }

    #[test]
    fn short_request_line_is_rejected() {
        let err = RequestLine::parse("GET /").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequestLine(ref line) if line == "GET /"));
        assert_eq!(err.to_string(), "invalid request line: \"GET /\"");
        assert!(RequestLine::parse("").is_err());
    }

    #[test]
    fn bad_gateway_format() {
        let bytes = bad_gateway_response("host is empty");
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Length: 26\r\nConnection: close\r\n\r\nBad Gateway: host is empty"
        );
    }
}
