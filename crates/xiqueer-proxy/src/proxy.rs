//! Capture proxy server.
//!
//! Listens on `127.0.0.1`, serves every accepted connection in its own task,
//! and can be started and stopped repeatedly from the host.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::handler::{
    handle_client, CaptureCallback, CapturedExchange, HandlerConfig, REQUEST_READ_TIMEOUT,
    RESPONSE_READ_TIMEOUT,
};
use crate::upstream::{NoopProtector, SocketProtector, UpstreamConnector, CONNECT_TIMEOUT};

/// Pending-connection queue length of the listener.
const LISTEN_BACKLOG: i32 = 128;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Hosts resolved to IPv4 addresses only.
    pub force_ipv4_hosts: Vec<String>,
    /// Hook run on every upstream socket.
    pub protector: Arc<dyn SocketProtector>,
    /// Client request read timeout.
    pub request_timeout: Duration,
    /// Upstream response read timeout.
    pub response_timeout: Duration,
    /// Per-candidate upstream connect timeout.
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("force_ipv4_hosts", &self.force_ipv4_hosts)
            .field("protector", &"SocketProtector")
            .field("request_timeout", &self.request_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyConfig {
    /// Creates a configuration with the standard timeouts and no protection.
    pub fn new() -> Self {
        Self {
            force_ipv4_hosts: Vec::new(),
            protector: Arc::new(NoopProtector),
            request_timeout: REQUEST_READ_TIMEOUT,
            response_timeout: RESPONSE_READ_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Sets the IPv4-only host list.
    pub fn with_force_ipv4_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_ipv4_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the socket protection hook.
    pub fn with_protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.protector = protector;
        self
    }

    /// Sets the client request read timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the upstream response read timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the per-candidate connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn handler_config(&self, on_capture: Option<CaptureCallback>) -> HandlerConfig {
        HandlerConfig {
            connector: UpstreamConnector::new(self.protector.clone())
                .with_force_ipv4_hosts(&self.force_ipv4_hosts)
                .with_connect_timeout(self.connect_timeout),
            on_capture,
            request_timeout: self.request_timeout,
            response_timeout: self.response_timeout,
        }
    }
}

/// A running accept loop.
struct RunningProxy {
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

/// Local forward/CONNECT proxy that reports completed HTTP exchanges.
pub struct ProxyServer {
    config: ProxyConfig,
    on_capture: Option<CaptureCallback>,
    running: Mutex<Option<RunningProxy>>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("on_capture", &self.on_capture.is_some())
            .field("port", &self.port())
            .finish()
    }
}

impl ProxyServer {
    /// Creates a stopped proxy server.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            on_capture: None,
            running: Mutex::new(None),
        }
    }

    /// Sets the callback for completed plain-HTTP exchanges.
    pub fn on_capture<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CapturedExchange) + Send + Sync + 'static,
    {
        self.on_capture = Some(Arc::new(callback));
        self
    }

    /// Port of the running listener, if any.
    pub fn port(&self) -> Option<u16> {
        self.running.lock().as_ref().map(|r| r.port)
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Binds `127.0.0.1:port` (0 picks a free port) and starts accepting.
    ///
    /// Returns the bound port. Calling this while running returns the
    /// current port without rebinding. Must be called from within a Tokio
    /// runtime.
    pub fn start(&self, port: u16) -> Result<u16> {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            return Ok(current.port);
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| ProxyError::Bind {
            port,
            source: io::Error::other(e),
        })?;

        let listener = {
            let _guard = runtime.enter();
            bind_listener(port).map_err(|source| ProxyError::Bind { port, source })?
        };
        let bound = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { port, source })?
            .port();

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let config = Arc::new(self.config.handler_config(self.on_capture.clone()));
        let handle = runtime.spawn(accept_loop(listener, config, shutdown_rx));

        info!("Capture proxy listening on 127.0.0.1:{}", bound);
        *running = Some(RunningProxy {
            port: bound,
            shutdown_tx,
            handle,
        });
        Ok(bound)
    }

    /// Stops accepting, aborts in-flight connections and waits for the loop
    /// to exit. Does nothing when already stopped.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        info!("Stopping capture proxy on port {}", running.port);
        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.handle.await {
            warn!("Proxy accept loop ended abnormally: {}", e);
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown_tx.send(());
        }
    }
}

fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<HandlerConfig>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    connections.spawn(handle_client(stream, config.clone()));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        warn!("Connection task panicked: {}", e);
                    }
                }
            }
        }
    }

    drop(listener);
    let in_flight = connections.len();
    connections.shutdown().await;
    info!("Capture proxy stopped ({} connections aborted)", in_flight);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::read_message;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn recording_server(config: ProxyConfig) -> (ProxyServer, Arc<StdMutex<Vec<CapturedExchange>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let server = ProxyServer::new(config).on_capture(move |exchange| {
            sink.lock().unwrap().push(exchange.clone());
        });
        (server, seen)
    }

    async fn send(port: u16, request: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        response
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let server = ProxyServer::new(ProxyConfig::new());
        assert!(!server.is_running());
        server.stop().await;

        let port = server.start(0).unwrap();
        assert_ne!(port, 0);
        assert_eq!(server.start(0).unwrap(), port);
        assert_eq!(server.port(), Some(port));

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.port(), None);

        // Restart after stop binds again
        let again = server.start(0).unwrap();
        assert_ne!(again, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn binding_a_taken_port_fails() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let server = ProxyServer::new(ProxyConfig::new());
        let err = server.start(port).unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert!(!server.is_running());
    }

    #[test]
    fn start_outside_runtime_fails() {
        let server = ProxyServer::new(ProxyConfig::new());
        assert!(matches!(server.start(0), Err(ProxyError::Bind { .. })));
    }

    #[tokio::test]
    async fn forwards_plain_http_and_reports_exchange() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        let upstream_task = tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let request = read_message(&mut reader).await.unwrap().unwrap();
            write_half
                .write_all(
                    b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
                )
                .await
                .unwrap();
            request
        });

        let (server, seen) = recording_server(ProxyConfig::new());
        let port = server.start(0).unwrap();

        let request = format!(
            "POST http://127.0.0.1:{}/jwweb/x?a=1 HTTP/1.1\r\nHost: 127.0.0.1\r\nProxy-Connection: keep-alive\r\nContent-Length: 9\r\n\r\nparam=abc",
            upstream_port
        );
        let response = send(port, request.as_bytes()).await;
        let response = String::from_utf8(response).unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Set-Cookie: a=1\r\n"));
        assert!(response.contains("Content-Length: 5\r\n"));
        assert!(!response.contains("chunked"));
        assert!(response.ends_with("\r\n\r\nhello"));

        let forwarded = upstream_task.await.unwrap();
        assert_eq!(forwarded.start_line, "POST /jwweb/x?a=1 HTTP/1.1");
        assert_eq!(forwarded.header("Connection"), Some("close"));
        assert!(forwarded.header("Proxy-Connection").is_none());
        assert_eq!(forwarded.body, b"param=abc");

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![CapturedExchange {
                host: "127.0.0.1".to_string(),
                path: "/jwweb/x?a=1".to_string(),
                request_body: "param=abc".to_string(),
                response_body: "hello".to_string(),
            }]
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn unresolvable_host_gets_bad_gateway() {
        let (server, seen) = recording_server(ProxyConfig::new());
        let port = server.start(0).unwrap();

        let response = send(
            port,
            b"GET http://nonexistent.invalid/x HTTP/1.1\r\nHost: nonexistent.invalid\r\n\r\n",
        )
        .await;
        let response = String::from_utf8(response).unwrap();

        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(response.ends_with("Bad Gateway: upstream request failed"));
        assert!(seen.lock().unwrap().is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn upstream_closing_without_response() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            let (read_half, _write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _ = read_message(&mut reader).await;
        });

        let (server, seen) = recording_server(ProxyConfig::new());
        let port = server.start(0).unwrap();

        let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", upstream_port);
        let response = String::from_utf8(send(port, request.as_bytes()).await).unwrap();

        assert!(response.ends_with("Bad Gateway: upstream sent no response"));
        assert!(seen.lock().unwrap().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let config = ProxyConfig::new().with_response_timeout(Duration::from_millis(200));
        let (server, seen) = recording_server(config);
        let port = server.start(0).unwrap();

        let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", upstream_port);
        let response = String::from_utf8(send(port, request.as_bytes()).await).unwrap();

        assert!(response.ends_with("Bad Gateway: upstream timed out"));
        assert!(seen.lock().unwrap().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn invalid_request_line_gets_bad_gateway() {
        let server = ProxyServer::new(ProxyConfig::new());
        let port = server.start(0).unwrap();

        let response = String::from_utf8(send(port, b"GARBAGE\r\n\r\n").await).unwrap();
        assert!(response.ends_with("Bad Gateway: invalid request line"));

        server.stop().await;
    }

    #[tokio::test]
    async fn missing_host_gets_bad_gateway() {
        let server = ProxyServer::new(ProxyConfig::new());
        let port = server.start(0).unwrap();

        let response = String::from_utf8(send(port, b"GET /a HTTP/1.1\r\n\r\n").await).unwrap();
        assert!(response.ends_with("Bad Gateway: host is empty"));

        server.stop().await;
    }

    #[tokio::test]
    async fn stalled_request_gets_bad_gateway() {
        let config = ProxyConfig::new().with_request_timeout(Duration::from_millis(100));
        let server = ProxyServer::new(config);
        let port = server.start(0).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: x").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        assert!(String::from_utf8(response)
            .unwrap()
            .ends_with("Bad Gateway: request read failed"));
        server.stop().await;
    }

    #[tokio::test]
    async fn silent_client_is_closed_without_answer() {
        let server = ProxyServer::new(ProxyConfig::new());
        let port = server.start(0).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        assert!(response.is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn connect_tunnel_relays_bytes_unchanged() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = echo.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();
            tokio::io::copy(&mut read_half, &mut write_half).await.unwrap();
            write_half.shutdown().await.unwrap();
        });

        let (server, seen) = recording_server(ProxyConfig::new());
        let port = server.start(0).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // Bytes sent together with the head must reach the upstream too
        let head = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: x\r\n\r\n", echo_port);
        client
            .write_all(&[head.as_bytes(), b"\x16\x03\x01early"].concat())
            .await
            .unwrap();

        let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
        let mut buf = vec![0u8; established.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, established);

        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x16\x03\x01early");

        let payload: Vec<u8> = (0..=255u8).cycle().take(20_000).collect();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        // Tunnels never report exchanges
        assert!(seen.lock().unwrap().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn connect_to_closed_port_gets_bad_gateway() {
        let server = ProxyServer::new(ProxyConfig::new());
        let port = server.start(0).unwrap();

        let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", unused_port());
        let response = String::from_utf8(send(port, request.as_bytes()).await).unwrap();
        assert!(response.ends_with("Bad Gateway: CONNECT failed"));

        server.stop().await;
    }

    #[tokio::test]
    async fn stop_aborts_open_tunnels() {
        let idle = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let idle_port = idle.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = idle.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let server = ProxyServer::new(ProxyConfig::new());
        let port = server.start(0).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let head = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", idle_port);
        client.write_all(head.as_bytes()).await.unwrap();
        let mut buf = [0u8; 39];
        client.read_exact(&mut buf).await.unwrap();

        server.stop().await;

        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn callback_panic_does_not_kill_the_proxy() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = upstream.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let _ = read_message(&mut reader).await;
                let _ = write_half
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .await;
            }
        });

        let server = ProxyServer::new(ProxyConfig::new()).on_capture(|_| panic!("boom"));
        let port = server.start(0).unwrap();
        let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", upstream_port);

        for _ in 0..2 {
            let response = String::from_utf8(send(port, request.as_bytes()).await).unwrap();
            assert!(response.ends_with("\r\n\r\nok"));
        }
        server.stop().await;
    }
}
