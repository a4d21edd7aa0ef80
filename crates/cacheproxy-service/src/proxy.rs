use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheTable;
use crate::config::Config;
use crate::connection::{ProxyState, handle_connection};
use crate::loader::{Loader, Loaders};
use crate::origin::Resolver;
use crate::pool::ConnectionPool;

/// Errors setting up the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind to {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to query the listening address")]
    LocalAddr(#[source] io::Error),
}

/// The caching proxy server.
///
/// [`bind`](Self::bind) opens the listening socket, [`run`](Self::run) serves clients until a
/// [`ShutdownHandle`] stops it.
#[derive(Debug)]
pub struct Proxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ProxyState>,
    pool: ConnectionPool,
    running: Arc<AtomicBool>,
}

impl Proxy {
    /// Binds to the configured address. Use port `0` to pick a random port.
    pub fn bind(config: &Config, resolver: Arc<dyn Resolver>) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.bind).map_err(|source| ProxyError::Bind {
            addr: config.bind,
            source,
        })?;
        let local_addr = listener.local_addr().map_err(ProxyError::LocalAddr)?;

        let state = ProxyState {
            cache: CacheTable::new(config.cache_buckets),
            loader: Arc::new(Loader::new(config, resolver)),
            loaders: Loaders::new(),
            max_request_size: config.max_request_size,
        };

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(state),
            pool: ConnectionPool::new(config.max_connections),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// The address the proxy accepts clients on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The cache shared by all connections.
    pub fn cache(&self) -> &CacheTable {
        &self.state.cache
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            pool: self.pool.clone(),
            wake_addr: wake_addr(self.local_addr),
        }
    }

    /// Accepts and serves clients until stopped.
    ///
    /// Each client is handed to its own connection slot. When all slots are busy, accepting
    /// pauses until a connection finishes. Once stopped, all client connections are shut down
    /// and every connection and loader thread is joined before this returns.
    pub fn run(self) {
        tracing::info!("proxy listening on {}", self.local_addr);

        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept connection");
                    continue;
                }
            };

            let Some(slot) = self.pool.acquire_slot() else {
                break;
            };

            let state = Arc::clone(&self.state);
            let spawned = self.pool.spawn(slot, stream, move |stream| {
                handle_connection(&state, stream);
            });
            if let Err(err) = spawned {
                tracing::error!(error = %err, "failed to spawn connection thread");
            }
        }

        tracing::info!("shutting down");
        self.pool.shutdown();
        self.state.loaders.join_all();
        tracing::info!("shutdown complete");
    }
}

/// Stops a running [`Proxy`] from another thread.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    pool: ConnectionPool,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    /// Requests the proxy to stop. Returns immediately; [`Proxy::run`] returns once everything
    /// has been torn down.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pool.close();

        // Wake up the blocking accept.
        if let Err(err) = TcpStream::connect_timeout(&self.wake_addr, Duration::from_secs(1)) {
            tracing::debug!(error = %err, "failed to wake up the accept loop");
        }
    }
}

/// The address to connect to in order to reach a listener bound to `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, addr.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, addr.port()).into(),
        _ => addr,
    }
}
