mod auth;
mod config;
mod connection;
mod http;
mod metrics;
mod relay;
mod session;
mod socks5;
mod upstream;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::CredentialResolver;
use crate::config::{Cli, Config};
use crate::connection::{
    handle_connection, is_connection_limit_exceeded, ConnectionGuard, ProxyState,
    ACTIVE_CONNECTIONS,
};
use crate::upstream::UpstreamPool;

/// Seconds to let in-flight relays drain on shutdown.
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("microproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config_path: PathBuf = args
        .config_path()
        .ok_or_else(|| eyre!("a configuration file is required (-c <path> or positional)"))?
        .to_path_buf();

    let config = Config::load(&config_path)?;

    let state = Arc::new(ProxyState {
        pool: UpstreamPool::new(config.upstreams()?),
        resolver: CredentialResolver::new(&config.upstream_proxy.logins),
    });
    info!(
        "loaded {} upstream proxies and {} login rules from {}",
        state.pool.len(),
        config.upstream_proxy.logins.len(),
        config_path.display()
    );

    let mut accept_tasks = Vec::new();
    if !config.microproxy.http_proto.is_empty() {
        let listener = bind(&config.microproxy.http_proto).await?;
        info!("HTTP proxy listening on {}", config.microproxy.http_proto);
        accept_tasks.push(tokio::task::spawn(accept_loop(listener, state.clone())));
    }
    if !config.microproxy.socks5_proto.is_empty() {
        let listener = bind(&config.microproxy.socks5_proto).await?;
        info!("SOCKS5 proxy listening on {}", config.microproxy.socks5_proto);
        accept_tasks.push(tokio::task::spawn(accept_loop(listener, state.clone())));
    }

    if !config.microproxy.metrics_proto.is_empty() {
        let addr = resolve_addr(&config.microproxy.metrics_proto).await?;
        tokio::task::spawn(async move {
            if let Err(err) = metrics::serve(addr).await {
                error!("metrics server failed: {}", err);
            }
        });
    }

    // SIGHUP swaps in a fresh snapshot; a bad file keeps the old one.
    {
        let state = state.clone();
        let path = config_path.clone();
        let mut hangup = unix_signal(SignalKind::hangup())?;
        tokio::task::spawn(async move {
            while hangup.recv().await.is_some() {
                reload(&path, &state);
            }
        });
    }

    let mut terminate = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => info!("SIGINT received"),
        _ = terminate.recv() => info!("SIGTERM received"),
    }

    // Stop accepting, then let existing relays drain.
    for task in &accept_tasks {
        task.abort();
    }

    let active = ACTIVE_CONNECTIONS.load(Ordering::Relaxed);
    if active > 0 {
        info!("waiting for {} connections to close...", active);
        for i in 1..=SHUTDOWN_GRACE_SECS {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let remaining = ACTIVE_CONNECTIONS.load(Ordering::Relaxed);
            if remaining == 0 {
                info!("all connections closed gracefully");
                break;
            }
            if i % 5 == 0 {
                info!(
                    "still waiting for {} connections... ({}/{}s)",
                    remaining, i, SHUTDOWN_GRACE_SECS
                );
            }
        }
        let remaining = ACTIVE_CONNECTIONS.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!("forced shutdown with {} connections still active", remaining);
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn reload(path: &Path, state: &ProxyState) {
    match Config::load(path) {
        Ok(new_config) => match new_config.upstreams() {
            Ok(upstreams) => {
                state.pool.replace(upstreams);
                state.resolver.replace(&new_config.upstream_proxy.logins);
                info!(
                    "configuration reloaded from {}: {} upstreams, {} login rules",
                    path.display(),
                    state.pool.len(),
                    new_config.upstream_proxy.logins.len()
                );
            }
            Err(err) => warn!("reload failed, keeping previous configuration: {}", err),
        },
        Err(err) => warn!("reload failed, keeping previous configuration: {}", err),
    }
}

async fn resolve_addr(endpoint: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(endpoint)
        .await
        .map_err(|err| eyre!("failed to resolve {}: {}", endpoint, err))?
        .next()
        .ok_or_else(|| eyre!("no addresses found for {}", endpoint))
}

async fn bind(endpoint: &str) -> Result<TcpListener> {
    let addr = resolve_addr(endpoint).await?;
    TcpListener::bind(addr)
        .await
        .map_err(|err| eyre!("failed to bind {}: {}", endpoint, err))
}

async fn accept_loop(listener: TcpListener, state: Arc<ProxyState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                if is_connection_limit_exceeded() {
                    warn!(
                        "connection limit reached ({}), dropping connection from {}",
                        ConnectionGuard::active_count(),
                        peer_addr
                    );
                    drop(stream);
                    continue;
                }

                let state = state.clone();
                tokio::task::spawn(async move {
                    let _guard = ConnectionGuard::new();
                    handle_connection(stream, peer_addr.ip(), state).await;
                });
            }
            Err(err) => {
                warn!("accept error: {} (continuing)", err);
                continue;
            }
        }
    }
}
