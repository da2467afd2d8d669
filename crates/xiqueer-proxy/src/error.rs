//! Error types for the proxy.

use std::io;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Message head exceeded the size limit.
    #[error("message head exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    /// Stream ended in the middle of a message.
    #[error("truncated message: {0}")]
    Truncated(&'static str),

    /// Chunk size line could not be parsed.
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// Request line is not `METHOD TARGET VERSION`.
    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),

    /// Name resolution failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but yielded no usable address.
    #[error("no {} address for {host}", address_kind(.ipv4_only))]
    NoAddress { host: String, ipv4_only: bool },

    /// Every connect candidate failed.
    #[error("upstream {host}:{port} unreachable: {reason}")]
    Upstream {
        host: String,
        port: u16,
        reason: String,
    },

    /// An operation did not finish in time.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The listening socket could not be created.
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Maps an unexpected EOF from `read_exact` and friends to `Truncated`.
    pub(crate) fn from_read(err: io::Error, context: &'static str) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProxyError::Truncated(context)
        } else {
            ProxyError::Io(err)
        }
    }
}

fn address_kind(ipv4_only: &bool) -> &'static str {
    if *ipv4_only {
        "IPv4"
    } else {
        "usable"
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
