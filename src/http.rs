use std::net::IpAddr;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::connection::{ProxyState, HEADER_READ_TIMEOUT};
use crate::metrics;
use crate::relay;
use crate::upstream::{connect_tunnel, PoolError, TunnelError};

/// Upper bound on a request or response header block.
pub(crate) const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Headers an intermediary must not forward (RFC 7230 §6.1).
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("upstream tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("upstream unavailable: {0}")]
    Upstream(String),
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    /// Responses only: body runs until the upstream closes.
    Close,
}

/// One parsed request head.
struct RequestHead {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    body: BodyFraming,
}

/// Serve one HTTP client connection: parse a single request, then either
/// tunnel (CONNECT) or forward it through the next upstream proxy.
pub async fn handle<S>(
    mut client: BufReader<S>,
    client_ip: IpAddr,
    state: &ProxyState,
) -> Result<(), HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let raw = match timeout(HEADER_READ_TIMEOUT, read_head(&mut client, MAX_HEADER_BYTES)).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(err)) => {
            let _ = client.write_all(RESPONSE_400).await;
            return Err(err.into());
        }
        Err(_) => {
            let _ = client.write_all(RESPONSE_400).await;
            return Err(HttpError::BadRequest(
                "timed out reading request header".to_string(),
            ));
        }
    };

    let head = match parse_request(&raw) {
        Ok(head) => head,
        Err(err) => {
            let _ = client.write_all(RESPONSE_400).await;
            return Err(err);
        }
    };
    metrics::inc_requests();
    debug!("{} {} from {}", head.method, head.target, client_ip);

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(client, head, client_ip, state).await
    } else {
        forward_request(client, head, client_ip, state).await
    }
}

/// CONNECT: open a tunnel through the next upstream, confirm to the client,
/// then relay opaque bytes.
async fn handle_connect<S>(
    mut client: BufReader<S>,
    head: RequestHead,
    client_ip: IpAddr,
    state: &ProxyState,
) -> Result<(), HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // CONNECT targets are authority-form: host:port.
    if head.target.starts_with('/') || !head.target.contains(':') {
        let _ = client.write_all(RESPONSE_400).await;
        return Err(HttpError::BadRequest(format!(
            "CONNECT target {:?} is not host:port",
            head.target
        )));
    }

    let upstream = match state.pool.next() {
        Ok(upstream) => upstream,
        Err(err) => {
            let _ = client.write_all(RESPONSE_502).await;
            return Err(err.into());
        }
    };
    let credential = state.resolver.resolve(client_ip);

    let upstream_stream = match connect_tunnel(&upstream, &head.target, credential.as_ref()).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = client.write_all(RESPONSE_502).await;
            return Err(err.into());
        }
    };

    client.write_all(RESPONSE_200_CONNECT).await?;
    metrics::inc_responses();

    let (up, down) = relay::relay(client, upstream_stream).await?;
    debug!(
        "CONNECT tunnel to {} closed: {}↑ {}↓ bytes",
        head.target, up, down
    );
    Ok(())
}

/// Forward a plain request as an absolute-URI proxy request and stream the
/// response back verbatim. One request per connection; both streams close
/// afterwards.
async fn forward_request<S>(
    mut client: BufReader<S>,
    head: RequestHead,
    client_ip: IpAddr,
    state: &ProxyState,
) -> Result<(), HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target = match absolute_target(&head) {
        Ok(target) => target,
        Err(err) => {
            let _ = client.write_all(RESPONSE_400).await;
            return Err(err);
        }
    };

    let upstream = match state.pool.next() {
        Ok(upstream) => upstream,
        Err(err) => {
            let _ = client.write_all(RESPONSE_502).await;
            return Err(err.into());
        }
    };
    let credential = state.resolver.resolve(client_ip);

    let stream = match TcpStream::connect(&upstream.addr).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = client.write_all(RESPONSE_502).await;
            return Err(HttpError::Upstream(format!(
                "failed to dial {}: {}",
                upstream, err
            )));
        }
    };
    let mut upstream_stream = BufReader::new(stream);

    let serialized = serialize_forward_head(&head, &target, credential.as_ref());
    upstream_stream.write_all(&serialized).await?;
    copy_request_body(&mut client, &mut upstream_stream, head.body).await?;

    // Response head goes back to the client verbatim.
    let response_raw = match read_head(&mut upstream_stream, MAX_HEADER_BYTES).await {
        Ok(raw) => raw,
        Err(err) => {
            let _ = client.write_all(RESPONSE_502).await;
            return Err(HttpError::Upstream(format!(
                "failed to read response from {}: {}",
                upstream, err
            )));
        }
    };
    let (status, response_headers) = match parse_response(&response_raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            let _ = client.write_all(RESPONSE_502).await;
            return Err(err);
        }
    };
    client.write_all(&response_raw).await?;

    match response_framing(&head.method, status, &response_headers) {
        BodyFraming::None => {}
        BodyFraming::Length(len) => {
            copy_exact(&mut upstream_stream, &mut client, len).await?;
        }
        BodyFraming::Chunked => {
            copy_chunked(&mut upstream_stream, &mut client).await?;
        }
        BodyFraming::Close => {
            tokio::io::copy(&mut upstream_stream, &mut client).await?;
        }
    }
    metrics::inc_responses();
    debug!("{} {} -> {} via {}", head.method, target, status, upstream);

    let _ = client.shutdown().await;
    let _ = upstream_stream.shutdown().await;
    Ok(())
}

/// Read a header block up to and including the blank line. Bytes past the
/// terminator stay buffered in the reader.
pub(crate) async fn read_head<R>(reader: &mut R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    loop {
        let byte = reader.read_u8().await?;
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() >= limit {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "header block too large",
            ));
        }
    }
}

fn parse_request(raw: &[u8]) -> Result<RequestHead, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HttpError::BadRequest("truncated header block".to_string()))
        }
        Err(err) => return Err(HttpError::BadRequest(err.to_string())),
    }

    let method = request
        .method
        .ok_or_else(|| HttpError::BadRequest("missing method".to_string()))?
        .to_string();
    let target = request
        .path
        .ok_or_else(|| HttpError::BadRequest("missing request target".to_string()))?
        .to_string();

    let mut parsed = Vec::with_capacity(request.headers.len());
    for header in request.headers.iter() {
        let value = std::str::from_utf8(header.value).map_err(|_| {
            HttpError::BadRequest(format!("header {} is not valid utf-8", header.name))
        })?;
        parsed.push((header.name.to_string(), value.to_string()));
    }

    let body = request_body_framing(&parsed)?;
    Ok(RequestHead {
        method,
        target,
        headers: parsed,
        body,
    })
}

fn parse_response(raw: &[u8]) -> Result<(u16, Vec<(String, String)>), HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => {
            return Err(HttpError::Upstream(
                "malformed response head".to_string(),
            ))
        }
    }
    let code = response
        .code
        .ok_or_else(|| HttpError::Upstream("response missing status".to_string()))?;
    let parsed = response
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect();
    Ok((code, parsed))
}

fn request_body_framing(headers: &[(String, String)]) -> Result<BodyFraming, HttpError> {
    if let Some(value) = header_value(headers, "transfer-encoding") {
        if value.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
    }
    if let Some(value) = header_value(headers, "content-length") {
        let len = value
            .trim()
            .parse::<u64>()
            .map_err(|_| HttpError::BadRequest("invalid Content-Length".to_string()))?;
        return Ok(BodyFraming::Length(len));
    }
    Ok(BodyFraming::None)
}

fn response_framing(method: &str, status: u16, headers: &[(String, String)]) -> BodyFraming {
    if method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304 {
        return BodyFraming::None;
    }
    if let Some(value) = header_value(headers, "transfer-encoding") {
        if value.to_ascii_lowercase().contains("chunked") {
            return BodyFraming::Chunked;
        }
    }
    if let Some(value) = header_value(headers, "content-length") {
        if let Ok(len) = value.trim().parse::<u64>() {
            return BodyFraming::Length(len);
        }
    }
    BodyFraming::Close
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Rewrite the request target to the absolute URI the upstream proxy expects.
fn absolute_target(head: &RequestHead) -> Result<String, HttpError> {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        return Ok(head.target.clone());
    }
    if !head.target.starts_with('/') {
        return Err(HttpError::BadRequest(format!(
            "unsupported request target {:?}",
            head.target
        )));
    }
    let host = header_value(&head.headers, "host")
        .ok_or_else(|| HttpError::BadRequest("missing Host header".to_string()))?;
    Ok(format!("http://{}{}", host, head.target))
}

/// Serialize the rewritten request head for the upstream proxy: absolute-URI
/// request line, hop-by-hop headers stripped, our Proxy-Authorization iff
/// credentials resolved. A chunked body keeps its original framing, so the
/// Transfer-Encoding it travels under is restated.
fn serialize_forward_head(
    head: &RequestHead,
    target: &str,
    credential: Option<&crate::auth::Credential>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method, target).as_bytes());
    for (name, value) in &head.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("proxy-authorization") {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if let Some(cred) = credential {
        out.extend_from_slice(format!("Proxy-Authorization: {}\r\n", cred.basic_value()).as_bytes());
    }
    if head.body == BodyFraming::Chunked {
        out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

async fn copy_request_body<R, W>(
    client: &mut R,
    upstream: &mut W,
    framing: BodyFraming,
) -> Result<(), HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None | BodyFraming::Close => Ok(()),
        BodyFraming::Length(len) => copy_exact(client, upstream, len).await,
        BodyFraming::Chunked => copy_chunked(client, upstream).await,
    }
}

/// Copy exactly `len` bytes; a short read is an error.
async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<(), HttpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if len == 0 {
        return Ok(());
    }
    let mut limited = reader.take(len);
    let copied = tokio::io::copy(&mut limited, writer).await?;
    if copied < len {
        return Err(HttpError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "body ended early",
        )));
    }
    Ok(())
}

/// Forward a chunked body byte-for-byte: size lines, chunk data, trailers.
async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<(), HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(HttpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "chunked body ended early",
            )));
        }
        writer.write_all(line.as_bytes()).await?;

        let size_field = line.trim_end().split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_field, 16)
            .map_err(|_| HttpError::BadRequest(format!("invalid chunk size {size_field:?}")))?;

        if size == 0 {
            // Trailer section runs until a blank line.
            loop {
                let mut trailer = String::new();
                if reader.read_line(&mut trailer).await? == 0 {
                    return Err(HttpError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "chunked trailers ended early",
                    )));
                }
                writer.write_all(trailer.as_bytes()).await?;
                if trailer == "\r\n" || trailer == "\n" {
                    return Ok(());
                }
            }
        }

        // Chunk data plus its trailing CRLF.
        copy_exact(reader, writer, size + 2).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialResolver;
    use crate::config::LoginRule;
    use crate::upstream::{Upstream, UpstreamPool};
    use base64::engine::general_purpose;
    use base64::Engine;
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn state_with_upstream(url: &str, logins: &[LoginRule]) -> Arc<ProxyState> {
        Arc::new(ProxyState {
            pool: UpstreamPool::new(vec![Upstream::parse(url).expect("valid upstream")]),
            resolver: CredentialResolver::new(logins),
        })
    }

    fn session_rule() -> LoginRule {
        LoginRule {
            ip_range: "10.0.0.0/8".to_string(),
            username: "user-${SESSION_ID}".to_string(),
            password: "pass".to_string(),
        }
    }

    async fn read_until_blank_line(stream: &mut tokio::net::TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.expect("stub read");
            head.push(byte[0]);
        }
        String::from_utf8(head).expect("ascii head")
    }

    #[tokio::test]
    async fn test_get_forwarding_rewrites_and_authenticates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");

        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("stub accept");
            let head = read_until_blank_line(&mut stream).await;

            let mut lines = head.lines();
            assert_eq!(
                lines.next().expect("request line"),
                "GET http://example.com/ HTTP/1.1"
            );
            assert!(head.contains("Host: example.com\r\n"));
            assert!(!head.to_ascii_lowercase().contains("proxy-connection"));

            let auth_line = head
                .lines()
                .find(|l| l.starts_with("Proxy-Authorization: Basic "))
                .expect("auth header present");
            let decoded = general_purpose::STANDARD
                .decode(auth_line.trim_start_matches("Proxy-Authorization: Basic "))
                .expect("valid base64");
            let decoded = String::from_utf8(decoded).expect("utf-8 credentials");
            assert!(decoded.starts_with("user-"), "got {decoded}");
            assert!(decoded.ends_with(":pass"), "got {decoded}");

            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .expect("stub reply");
        });

        let state = state_with_upstream(&format!("http://{addr}"), &[session_rule()]);
        let (mut client, server_side) = duplex(8192);
        let task = tokio::spawn(async move {
            handle(
                BufReader::new(server_side),
                "10.1.2.3".parse().unwrap(),
                &state,
            )
            .await
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n")
            .await
            .expect("client write");

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.expect("client read");
        let response = String::from_utf8(response).expect("ascii response");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got {response}");
        assert!(response.ends_with("hello"), "got {response}");

        stub.await.expect("stub");
        task.await.expect("join").expect("handler");
    }

    #[tokio::test]
    async fn test_absolute_form_target_passes_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");

        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("stub accept");
            let head = read_until_blank_line(&mut stream).await;
            assert!(head.starts_with("GET http://example.com/page?q=1 HTTP/1.1\r\n"));
            // No credentials resolve for this client.
            assert!(!head.to_ascii_lowercase().contains("proxy-authorization"));
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .expect("stub reply");
        });

        let state = state_with_upstream(&format!("http://{addr}"), &[session_rule()]);
        let (mut client, server_side) = duplex(8192);
        let task = tokio::spawn(async move {
            handle(
                BufReader::new(server_side),
                "192.168.1.1".parse().unwrap(),
                &state,
            )
            .await
        });

        client
            .write_all(b"GET http://example.com/page?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .expect("client write");

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.expect("client read");
        assert!(response.starts_with(b"HTTP/1.1 204 No Content\r\n"));

        stub.await.expect("stub");
        task.await.expect("join").expect("handler");
    }

    #[tokio::test]
    async fn test_connect_tunnel_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");

        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("stub accept");
            let head = read_until_blank_line(&mut stream).await;
            assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .expect("stub reply");

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.expect("stub ping");
            assert_eq!(&buf, b"PING");
            stream.write_all(b"PONG").await.expect("stub pong");
        });

        let state = state_with_upstream(&format!("http://{addr}"), &[]);
        let (mut client, server_side) = duplex(8192);
        let task = tokio::spawn(async move {
            handle(
                BufReader::new(server_side),
                "127.0.0.1".parse().unwrap(),
                &state,
            )
            .await
        });

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .expect("client write");

        let mut established = [0u8; 39];
        client.read_exact(&mut established).await.expect("client read");
        assert_eq!(
            &established[..],
            b"HTTP/1.1 200 Connection Established\r\n\r\n"
        );

        client.write_all(b"PING").await.expect("client ping");
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.expect("client pong");
        assert_eq!(&pong, b"PONG");

        drop(client);
        stub.await.expect("stub");
        task.await.expect("join").expect("handler");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_yields_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let state = state_with_upstream(&format!("http://{addr}"), &[]);
        let (mut client, server_side) = duplex(8192);
        let task = tokio::spawn(async move {
            handle(
                BufReader::new(server_side),
                "127.0.0.1".parse().unwrap(),
                &state,
            )
            .await
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .expect("client write");

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.expect("client read");
        assert_eq!(response, RESPONSE_502);
        assert!(task.await.expect("join").is_err());
    }

    #[tokio::test]
    async fn test_refused_connect_yields_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");

        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("stub accept");
            let _head = read_until_blank_line(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .expect("stub reply");
        });

        let state = state_with_upstream(&format!("http://{addr}"), &[]);
        let (mut client, server_side) = duplex(8192);
        let task = tokio::spawn(async move {
            handle(
                BufReader::new(server_side),
                "127.0.0.1".parse().unwrap(),
                &state,
            )
            .await
        });

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .expect("client write");

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.expect("client read");
        assert_eq!(response, RESPONSE_502);

        stub.await.expect("stub");
        assert!(matches!(
            task.await.expect("join"),
            Err(HttpError::Tunnel(TunnelError::Refused(407)))
        ));
    }

    #[tokio::test]
    async fn test_malformed_request_yields_400() {
        let state = state_with_upstream("http://127.0.0.1:1", &[]);
        let (mut client, server_side) = duplex(8192);
        let task = tokio::spawn(async move {
            handle(
                BufReader::new(server_side),
                "127.0.0.1".parse().unwrap(),
                &state,
            )
            .await
        });

        client
            .write_all(b"NOT A REQUEST\0\r\n\r\n")
            .await
            .expect("client write");

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.expect("client read");
        assert_eq!(response, RESPONSE_400);
        assert!(task.await.expect("join").is_err());
    }

    #[test]
    fn test_hop_by_hop_detection() {
        for name in ["Connection", "PROXY-CONNECTION", "keep-alive", "TE", "Trailer", "Transfer-Encoding", "Upgrade"] {
            assert!(is_hop_by_hop(name), "{name} should be hop-by-hop");
        }
        assert!(!is_hop_by_hop("Host"));
        assert!(!is_hop_by_hop("Content-Length"));
        assert!(!is_hop_by_hop("Accept"));
    }

    #[test]
    fn test_serialize_forward_head_strips_and_injects() {
        let head = RequestHead {
            method: "POST".to_string(),
            target: "/submit".to_string(),
            headers: vec![
                ("Host".to_string(), "example.com".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
                ("Keep-Alive".to_string(), "timeout=5".to_string()),
                ("Proxy-Authorization".to_string(), "Basic client-supplied".to_string()),
                ("Content-Length".to_string(), "4".to_string()),
            ],
            body: BodyFraming::Length(4),
        };
        let cred = crate::auth::Credential {
            username: "user".to_string(),
            password: "pass".to_string(),
        };

        let out = serialize_forward_head(&head, "http://example.com/submit", Some(&cred));
        let out = String::from_utf8(out).expect("ascii");

        assert!(out.starts_with("POST http://example.com/submit HTTP/1.1\r\n"));
        assert!(out.contains("Host: example.com\r\n"));
        assert!(out.contains("Content-Length: 4\r\n"));
        assert!(out.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(!out.contains("keep-alive"));
        assert!(!out.contains("client-supplied"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_serialize_forward_head_restates_chunked() {
        let head = RequestHead {
            method: "POST".to_string(),
            target: "/upload".to_string(),
            headers: vec![
                ("Host".to_string(), "example.com".to_string()),
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ],
            body: BodyFraming::Chunked,
        };

        let out = serialize_forward_head(&head, "http://example.com/upload", None);
        let out = String::from_utf8(out).expect("ascii");
        assert_eq!(out.matches("Transfer-Encoding: chunked\r\n").count(), 1);
        assert!(!out.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn test_copy_chunked_passthrough() {
        let input = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n";
        let (mut reader, mut feed) = duplex(1024);
        feed.write_all(input).await.expect("feed");
        drop(feed);

        let mut reader = BufReader::new(&mut reader);
        let mut out = Vec::new();
        copy_chunked(&mut reader, &mut out).await.expect("copy");
        assert_eq!(out, input);
    }

    #[test]
    fn test_response_framing_rules() {
        let no_headers: Vec<(String, String)> = Vec::new();
        assert_eq!(response_framing("HEAD", 200, &no_headers), BodyFraming::None);
        assert_eq!(response_framing("GET", 204, &no_headers), BodyFraming::None);
        assert_eq!(response_framing("GET", 304, &no_headers), BodyFraming::None);
        assert_eq!(response_framing("GET", 200, &no_headers), BodyFraming::Close);

        let length = vec![("Content-Length".to_string(), "12".to_string())];
        assert_eq!(response_framing("GET", 200, &length), BodyFraming::Length(12));

        let chunked = vec![("Transfer-Encoding".to_string(), "chunked".to_string())];
        assert_eq!(response_framing("GET", 200, &chunked), BodyFraming::Chunked);
    }

    #[test]
    fn test_absolute_target_requires_host() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "/".to_string(),
            headers: Vec::new(),
            body: BodyFraming::None,
        };
        assert!(matches!(
            absolute_target(&head),
            Err(HttpError::BadRequest(_))
        ));
    }
}
