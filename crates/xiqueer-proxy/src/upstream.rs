//! Upstream connections.
//!
//! Every outbound socket is created by hand so the host can "protect" it
//! before it connects. On Android-style capture setups this is what keeps the
//! proxy's own traffic from looping back into the capture interface; desktop
//! hosts use [`NoopProtector`].

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};

/// Per-candidate connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hook run on every upstream socket before it connects.
pub trait SocketProtector: Send + Sync {
    /// Returns `false` if the socket could not be protected.
    fn protect(&self, socket: &Socket) -> bool;
}

impl<F> SocketProtector for F
where
    F: Fn(&Socket) -> bool + Send + Sync,
{
    fn protect(&self, socket: &Socket) -> bool {
        self(socket)
    }
}

/// Protector that accepts every socket unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _socket: &Socket) -> bool {
        true
    }
}

/// Opens protected TCP connections to upstream hosts.
#[derive(Clone)]
pub struct UpstreamConnector {
    force_ipv4_hosts: Arc<HashSet<String>>,
    protector: Arc<dyn SocketProtector>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("force_ipv4_hosts", &self.force_ipv4_hosts)
            .field("protector", &"SocketProtector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for UpstreamConnector {
    fn default() -> Self {
        Self::new(Arc::new(NoopProtector))
    }
}

impl UpstreamConnector {
    pub fn new(protector: Arc<dyn SocketProtector>) -> Self {
        Self {
            force_ipv4_hosts: Arc::new(HashSet::new()),
            protector,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Hosts that only ever get IPv4 candidates. Matched case-insensitively.
    pub fn with_force_ipv4_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.force_ipv4_hosts = Arc::new(
            hosts
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        );
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether `host` is on the IPv4-only list.
    pub fn forces_ipv4(&self, host: &str) -> bool {
        self.force_ipv4_hosts.contains(&host.to_ascii_lowercase())
    }

    /// Connects to the first reachable address of `host`.
    ///
    /// Candidates are tried in order with no retries; the error carries the
    /// last candidate's failure.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let force_ipv4 = self.forces_ipv4(host);
        let candidates = resolve(host, port, force_ipv4).await?;
        debug!(
            "Resolved {}:{} to {:?} (ipv4_only={})",
            host, port, candidates, force_ipv4
        );

        let mut last_error = String::from("no candidates");
        for addr in candidates {
            match self.connect_candidate(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!("Connect to {} ({}) failed: {}", host, addr, e);
                    last_error = format!("{}: {}", addr, e);
                }
            }
        }

        Err(ProxyError::Upstream {
            host: host.to_string(),
            port,
            reason: last_error,
        })
    }

    async fn connect_candidate(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if !self.protector.protect(&socket) {
            warn!("Socket protection failed for {}, connecting anyway", addr);
        }
        socket.set_nonblocking(true)?;

        let socket = TcpSocket::from_std_stream(socket.into());
        match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.connect_timeout),
            )),
        }
    }
}

/// Resolves `host` with the system resolver, IPv4 addresses first.
pub async fn resolve(host: &str, port: u16, force_ipv4: bool) -> Result<Vec<SocketAddr>> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ProxyError::Resolve {
            host: host.to_string(),
            source,
        })?;

    let ordered = order_candidates(addrs, force_ipv4);
    if ordered.is_empty() {
        return Err(ProxyError::NoAddress {
            host: host.to_string(),
            ipv4_only: force_ipv4,
        });
    }
    Ok(ordered)
}

/// Stable IPv4-then-IPv6 ordering; `force_ipv4` drops IPv6 entirely.
pub fn order_candidates<I>(addrs: I, force_ipv4: bool) -> Vec<SocketAddr>
where
    I: IntoIterator<Item = SocketAddr>,
{
    let (v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
        addrs.into_iter().partition(SocketAddr::is_ipv4);

    if force_ipv4 {
        v4
    } else {
        v4.into_iter().chain(v6).collect()
    }
}
