use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::time::timeout;
use tracing::debug;

use crate::auth::CredentialResolver;
use crate::upstream::UpstreamPool;
use crate::{http, socks5};

/// Time allowed for a client to produce its first byte and request head.
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Ceiling on concurrently handled connections; accepts beyond it are
/// closed immediately.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 10_000;

/// Global counter of live client connections.
pub static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Shared snapshot sources every connection task resolves against. The pool
/// and rule set are swapped on reload; a connection keeps whatever it
/// already selected.
pub struct ProxyState {
    pub pool: UpstreamPool,
    pub resolver: CredentialResolver,
}

/// RAII guard to ensure the connection count is properly decremented
pub struct ConnectionGuard(());

impl ConnectionGuard {
    /// Create a new connection guard and increment the global counter
    pub fn new() -> Self {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        Self(())
    }

    /// Get the current active connection count
    pub fn active_count() -> usize {
        ACTIVE_CONNECTIONS.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if the current connection count exceeds the maximum limit
pub fn is_connection_limit_exceeded() -> bool {
    ConnectionGuard::active_count() >= MAX_CONCURRENT_CONNECTIONS
}

/// Identify the protocol on a fresh client stream and run the matching
/// handler.
///
/// The first byte is peeked through the buffered reader without being
/// consumed: `0x05` can only start a SOCKS5 greeting, anything else is
/// treated as the beginning of an HTTP request line. A stream that produces
/// no byte within the header timeout is closed silently.
pub async fn handle_connection<S>(stream: S, client_ip: IpAddr, state: Arc<ProxyState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader = BufReader::new(stream);

    let first = match timeout(HEADER_READ_TIMEOUT, reader.fill_buf()).await {
        Ok(Ok(buf)) if !buf.is_empty() => buf[0],
        Ok(Ok(_)) => return, // EOF before any byte
        Ok(Err(err)) => {
            debug!("failed to peek client connection from {}: {}", client_ip, err);
            return;
        }
        Err(_) => {
            debug!(
                "client {} sent no data within {:?}",
                client_ip, HEADER_READ_TIMEOUT
            );
            return;
        }
    };

    if first == socks5::SOCKS_VERSION {
        if let Err(err) = socks5::handle(reader, client_ip, &state).await {
            debug!("SOCKS5 session from {} ended: {}", client_ip, err);
        }
    } else if let Err(err) = http::handle(reader, client_ip, &state).await {
        debug!("HTTP session from {} ended: {}", client_ip, err);
    }
}
