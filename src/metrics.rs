use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Client-initiated request units: one per forwarded HTTP request, one per
/// HTTP CONNECT, one per SOCKS5 connection.
pub static REQUESTS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Responses fully flushed back to a client, or tunnels established.
pub static RESPONSES_TOTAL: AtomicU64 = AtomicU64::new(0);

pub fn inc_requests() {
    REQUESTS_TOTAL.fetch_add(1, Ordering::Release);
}

pub fn inc_responses() {
    RESPONSES_TOTAL.fetch_add(1, Ordering::Release);
}

/// Render the counters in the plain-text exposition format.
pub fn render() -> String {
    format!(
        "requests_total {}\nresponses_total {}\n",
        REQUESTS_TOTAL.load(Ordering::Acquire),
        RESPONSES_TOTAL.load(Ordering::Acquire)
    )
}

async fn metrics_service(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() == Method::GET && req.uri().path() == "/metrics" {
        Ok(Response::new(Full::new(Bytes::from(render()))))
    } else {
        let mut resp = Response::new(Full::new(Bytes::new()));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        Ok(resp)
    }
}

/// Serve `GET /metrics` until the task is aborted.
pub async fn serve(addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        tokio::task::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_service))
                .await
            {
                warn!("metrics connection error: {:?}", err);
            }
        });
    }
}
