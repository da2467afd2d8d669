//! Xiqueer Proxy - local capture proxy for the timetable exchange.
//!
//! A small forward proxy that sits between the campus app and the network.
//! Plain HTTP requests are forwarded and the finished exchange is reported to
//! a callback; `CONNECT` requests are relayed as opaque byte tunnels (TLS is
//! never terminated).
//!
//! ## Architecture
//!
//! ```text
//! Client → ProxyServer (accept) → handle_client → read_message
//!                                                      │
//!                                   ┌──────────────────┴──────────────────┐
//!                                   │ CONNECT                             │ other methods
//!                                   ▼                                     ▼
//!                       UpstreamConnector::connect             normalize_target + forward
//!                                   │                                     │
//!                                   ▼                                     ▼
//!                          tunnel::relay (both ways)         response → client → callback
//! ```
//!
//! Any failure before a response is relayed is answered with
//! `502 Bad Gateway` and the connection is closed.

mod error;
mod handler;
mod proxy;
pub mod state;
pub mod tunnel;
pub mod upstream;
pub mod wire;

pub use error::{ProxyError, Result};
pub use handler::{
    bad_gateway_response, normalize_target, CaptureCallback, CapturedExchange, NormalizedTarget,
    REQUEST_READ_TIMEOUT, RESPONSE_READ_TIMEOUT,
};
pub use proxy::{ProxyConfig, ProxyServer};
pub use state::{CaptureState, CaptureStateCell};
pub use upstream::{resolve, NoopProtector, SocketProtector, UpstreamConnector, CONNECT_TIMEOUT};
pub use wire::{read_message, Header, WireMessage, MAX_HEAD_BYTES};

/// Re-exported so protect hooks can name the socket type.
pub use socket2::Socket;
