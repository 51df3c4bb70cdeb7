use std::fmt;
use std::sync::Mutex;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::Credential;
use crate::http::{read_head, MAX_HEADER_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no upstream proxies configured")]
    NoUpstreams,
}

/// Error establishing a CONNECT tunnel through an upstream proxy.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("upstream i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response from upstream")]
    MalformedResponse,

    #[error("upstream refused CONNECT with status {0}")]
    Refused(u16),
}

/// A single upstream HTTP proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Endpoint as configured, e.g. `http://proxy.example.net:8080`.
    pub url: String,
    /// Dialable `host:port` form.
    pub addr: String,
}

impl Upstream {
    /// Parse an endpoint of the form `http://host:port`.
    pub fn parse(url: &str) -> Result<Self, String> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| format!("upstream {url:?} must start with http://"))?;
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| format!("upstream {url:?} is missing a port"))?;
        if host.is_empty() {
            return Err(format!("upstream {url:?} is missing a host"));
        }
        port.parse::<u16>()
            .map_err(|_| format!("upstream {url:?} has an invalid port"))?;
        Ok(Self {
            url: url.to_string(),
            addr: format!("{host}:{port}"),
        })
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

struct PoolInner {
    endpoints: Vec<Upstream>,
    cursor: usize,
}

/// Strict round-robin rotation over the configured upstream proxies.
///
/// Shared by all connection tasks; the cursor advances exactly once per
/// `next()` call. No health checking: a failing upstream is simply the next
/// caller's problem.
pub struct UpstreamPool {
    inner: Mutex<PoolInner>,
}

impl UpstreamPool {
    pub fn new(endpoints: Vec<Upstream>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                endpoints,
                cursor: 0,
            }),
        }
    }

    /// Return the endpoint at the cursor and advance it modulo the length.
    pub fn next(&self) -> Result<Upstream, PoolError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.endpoints.is_empty() {
            return Err(PoolError::NoUpstreams);
        }
        let picked = inner.endpoints[inner.cursor].clone();
        inner.cursor = (inner.cursor + 1) % inner.endpoints.len();
        Ok(picked)
    }

    /// Swap in a new endpoint list. The cursor restarts at the front; callers
    /// mid-`next()` observe either the old list or the new one, never a mix.
    pub fn replace(&self, endpoints: Vec<Upstream>) {
        let mut inner = self.inner.lock().unwrap();
        inner.endpoints = endpoints;
        inner.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().endpoints.len()
    }
}

/// Dial an upstream proxy and request a CONNECT tunnel to `target`.
///
/// On success the returned stream is an opaque pipe to the target. Bytes the
/// upstream sent past its response head stay buffered in the reader and are
/// delivered first by the relay.
pub async fn connect_tunnel(
    upstream: &Upstream,
    target: &str,
    credential: Option<&Credential>,
) -> Result<BufReader<TcpStream>, TunnelError> {
    let stream = TcpStream::connect(&upstream.addr).await?;
    let mut stream = BufReader::new(stream);

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(cred) = credential {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", cred.basic_value()));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_head(&mut stream, MAX_HEADER_BYTES).await?;
    let status = parse_status(&head).ok_or(TunnelError::MalformedResponse)?;
    if !(200..300).contains(&status) {
        return Err(TunnelError::Refused(status));
    }
    debug!("tunnel to {} established via {}", target, upstream);
    Ok(stream)
}

fn parse_status(head: &[u8]) -> Option<u16> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => response.code,
        _ => None,
    }
}
