use std::net::{IpAddr, Ipv4Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::debug;

use crate::connection::{ProxyState, HEADER_READ_TIMEOUT};
use crate::metrics;
use crate::relay;
use crate::upstream::{PoolError, TunnelError};

// SOCKS5 constants (RFC 1928)
pub const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Success reply. The upstream-side endpoint is not exposed, so the bound
/// address is always reported as 0.0.0.0:0.
const REPLY_SUCCESS: [u8; 10] = [SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SOCKS version {0:#04x}")]
    Version(u8),

    #[error("unsupported command {0:#04x}")]
    Command(u8),

    #[error("unsupported address type {0:#04x}")]
    AddressType(u8),

    #[error("target domain is not valid utf-8")]
    BadDomain,

    #[error("timed out reading SOCKS5 request")]
    Timeout,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("upstream tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Serve one SOCKS5 client: greeting, CONNECT request, upstream tunnel,
/// relay. Error replies use the short two-byte form; a wrong version or a
/// short read closes the stream with no reply at all.
pub async fn handle<S>(
    mut client: BufReader<S>,
    client_ip: IpAddr,
    state: &ProxyState,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target = match timeout(HEADER_READ_TIMEOUT, read_request(&mut client)).await {
        Ok(Ok(target)) => target,
        Ok(Err(err)) => return Err(err),
        Err(_) => return Err(SocksError::Timeout),
    };
    metrics::inc_requests();
    debug!("SOCKS5 CONNECT to {} from {}", target, client_ip);

    let upstream = match state.pool.next() {
        Ok(upstream) => upstream,
        Err(err) => {
            client
                .write_all(&[SOCKS_VERSION, REP_GENERAL_FAILURE])
                .await?;
            return Err(err.into());
        }
    };
    let credential = state.resolver.resolve(client_ip);

    let upstream_stream =
        match crate::upstream::connect_tunnel(&upstream, &target, credential.as_ref()).await {
            Ok(stream) => stream,
            Err(err) => {
                client
                    .write_all(&[SOCKS_VERSION, REP_GENERAL_FAILURE])
                    .await?;
                return Err(err.into());
            }
        };

    client.write_all(&REPLY_SUCCESS).await?;
    metrics::inc_responses();

    let (up, down) = relay::relay(client, upstream_stream).await?;
    debug!("SOCKS5 session to {} closed: {}↑ {}↓ bytes", target, up, down);
    Ok(())
}

/// Run the greeting and request phases, returning the target as `host:port`.
/// Protocol error replies are written here; version errors get none.
async fn read_request<S>(client: &mut BufReader<S>) -> Result<String, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let ver = client.read_u8().await?;
    if ver != SOCKS_VERSION {
        return Err(SocksError::Version(ver));
    }
    let nmethods = client.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;

    // Request: VER CMD RSV ATYP
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(SocksError::Version(header[0]));
    }
    if header[1] != CMD_CONNECT {
        client
            .write_all(&[SOCKS_VERSION, REP_CMD_NOT_SUPPORTED])
            .await?;
        return Err(SocksError::Command(header[1]));
    }

    match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            client.read_exact(&mut addr).await?;
            let port = client.read_u16().await?;
            Ok(format!("{}:{}", Ipv4Addr::from(addr), port))
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            client.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain).map_err(|_| SocksError::BadDomain)?;
            let port = client.read_u16().await?;
            Ok(format!("{}:{}", domain, port))
        }
        other => {
            client
                .write_all(&[SOCKS_VERSION, REP_ATYP_NOT_SUPPORTED])
                .await?;
            Err(SocksError::AddressType(other))
        }
    }
}
