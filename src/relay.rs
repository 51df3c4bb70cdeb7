use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Fixed transfer buffer per direction.
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Teardown begins after this long without traffic in either direction.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Bidirectionally stream bytes between two established connections.
///
/// EOF on one direction half-closes the peer's write side and lets the
/// opposite direction drain; the relay completes when both directions have
/// terminated, a write fails, or the idle timer fires. Returns the bytes
/// copied client→upstream and upstream→client.
pub async fn relay<A, B>(client: A, upstream: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    relay_with_idle(client, upstream, IDLE_TIMEOUT).await
}

pub async fn relay_with_idle<A, B>(
    mut client: A,
    mut upstream: B,
    idle_timeout: Duration,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut upstream_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut from_client = 0u64;
    let mut from_upstream = 0u64;
    let mut client_open = true;
    let mut upstream_open = true;

    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    while client_open || upstream_open {
        tokio::select! {
            res = client.read(&mut client_buf), if client_open => match res {
                Ok(0) => {
                    client_open = false;
                    let _ = upstream.shutdown().await;
                }
                Ok(n) => {
                    upstream.write_all(&client_buf[..n]).await?;
                    from_client += n as u64;
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
                Err(err) => {
                    debug!("client read error: {}", err);
                    break;
                }
            },
            res = upstream.read(&mut upstream_buf), if upstream_open => match res {
                Ok(0) => {
                    upstream_open = false;
                    let _ = client.shutdown().await;
                }
                Ok(n) => {
                    client.write_all(&upstream_buf[..n]).await?;
                    from_upstream += n as u64;
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
                Err(err) => {
                    debug!("upstream read error: {}", err);
                    break;
                }
            },
            _ = &mut idle => {
                debug!("relay idle for {:?}, closing", idle_timeout);
                break;
            }
        }
    }

    let _ = upstream.shutdown().await;
    let _ = client.shutdown().await;
    Ok((from_client, from_upstream))
}
