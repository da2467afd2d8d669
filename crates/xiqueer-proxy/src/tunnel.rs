//! Opaque byte relay for CONNECT tunnels.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Buffer size of each relay direction.
pub const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Bytes moved in each direction of a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relays both directions until each side has reached end-of-stream.
///
/// EOF on one side half-closes the opposite writer, so a peer that shuts
/// down its sending side still receives the rest of the response.
pub async fn relay<CR, CW, UR, UW>(
    client_read: CR,
    client_write: CW,
    upstream_read: UR,
    upstream_write: UW,
) -> RelayStats
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let (client_to_upstream, upstream_to_client) = tokio::join!(
        pump(client_read, upstream_write, "client->upstream"),
        pump(upstream_read, client_write, "upstream->client"),
    );

    RelayStats {
        client_to_upstream,
        upstream_to_client,
    }
}

async fn pump<R, W>(mut from: R, mut to: W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = match from.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_relay_error(direction, &e);
                break;
            }
        };

        if let Err(e) = to.write_all(&buf[..read]).await {
            log_relay_error(direction, &e);
            break;
        }
        total += read as u64;
    }

    if let Err(e) = to.shutdown().await {
        log_relay_error(direction, &e);
    }
    total
}

fn log_relay_error(direction: &str, err: &io::Error) {
    if is_expected_close(err) {
        debug!("Tunnel {} closed: {}", direction, err);
    } else {
        warn!("Tunnel {} failed: {}", direction, err);
    }
}

/// Errors that just mean the peer went away.
fn is_expected_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
            | io::ErrorKind::NotConnected
    )
}
