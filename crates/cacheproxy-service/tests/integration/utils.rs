use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cacheproxy_service::cache::CacheTable;
use cacheproxy_service::config::Config;
use cacheproxy_service::origin::{Resolver, StaticResolver};
use cacheproxy_service::proxy::{Proxy, ShutdownHandle};
use cacheproxy_test::Origin;

pub use cacheproxy_test::{get, send, setup};

/// A proxy running on a background thread, bound to a random loopback port.
///
/// Dropping it stops the proxy and waits for it to shut down.
pub struct TestProxy {
    addr: SocketAddr,
    cache: CacheTable,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestProxy {
    /// Starts a proxy that sends every request to `origin`.
    pub fn new(origin: &Origin) -> Self {
        Self::with_config(config(origin))
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_resolver(config, Arc::new(StaticResolver(Ipv4Addr::LOCALHOST)))
    }

    pub fn with_resolver(config: Config, resolver: Arc<dyn Resolver>) -> Self {
        let proxy = Proxy::bind(&config, resolver).unwrap();
        let addr = proxy.local_addr();
        let cache = proxy.cache().clone();
        let shutdown = proxy.shutdown_handle();
        let thread = thread::spawn(move || proxy.run());

        Self {
            addr,
            cache,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn cache(&self) -> &CacheTable {
        &self.cache
    }

    pub fn get(&self, url: &str) -> Vec<u8> {
        get(self.addr, url)
    }

    pub fn send(&self, request: &[u8]) -> Vec<u8> {
        send(self.addr, request)
    }

    /// Stops the proxy and waits until it has shut down.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// A config pointing the proxy at `origin` with short timeouts.
pub fn config(origin: &Origin) -> Config {
    Config {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        upstream_port: origin.port(),
        connect_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

/// Fails every lookup.
#[derive(Debug)]
pub struct UnknownHosts;

impl Resolver for UnknownHosts {
    fn resolve(&self, host: &str) -> io::Result<Ipv4Addr> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown host {host}"),
        ))
    }
}

pub const BAD_REQUEST: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\r\n";
pub const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.0 405 Method Not Allowed\r\n\r\n";
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.0 502 Bad Gateway\r\n\r\n";
