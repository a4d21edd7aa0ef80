//! Fetching resources from their origin.
//!
//! A [`Loader`] performs one plain HTTP/1.0 request per cache entry and completes the entry with
//! the raw response. Loads run on their own threads, which are tracked in [`Loaders`] so they can
//! be joined before the cache goes away.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use sentry::Hub;

use crate::cache::{CacheEntry, EntryState, LoadError, LoadResult};
use crate::config::Config;
use crate::origin::{OriginTarget, Resolver};
use crate::utils::{defer, timeout};

/// Size of a single read from the origin.
const CHUNK_SIZE: usize = 32 * 1024;

/// Fetches resources from their origin servers.
pub struct Loader {
    resolver: Arc<dyn Resolver>,
    upstream_port: u16,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
}

impl Loader {
    pub fn new(config: &Config, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            upstream_port: config.upstream_port,
            connect_timeout: timeout(config.connect_timeout),
            read_timeout: timeout(config.read_timeout),
        }
    }

    /// Fetches `url` from its origin and returns the complete raw response.
    ///
    /// There are no retries. Any failure, as well as an empty response, is an error.
    pub fn fetch(&self, url: &str) -> LoadResult {
        let target = OriginTarget::parse(url)?;
        let ip = self
            .resolver
            .resolve(target.host)
            .map_err(|err| LoadError::Resolve(format!("{}: {err}", target.host)))?;
        let addr = SocketAddr::from((ip, self.upstream_port));

        tracing::debug!(url, %addr, "fetching from origin");

        let mut stream = self
            .connect(addr)
            .map_err(|err| LoadError::Connect(format!("{addr}: {err}")))?;

        stream
            .write_all(target.request().as_bytes())
            .map_err(|err| LoadError::Send(err.to_string()))?;

        let data = read_response(&mut stream)?;
        if data.is_empty() {
            return Err(LoadError::EmptyResponse);
        }

        Ok(Bytes::from(data))
    }

    fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_read_timeout(self.read_timeout)?;
        stream.set_write_timeout(self.read_timeout)?;
        Ok(stream)
    }

    /// Fetches the entry's URL and completes the entry with the result.
    ///
    /// The entry must be `Loading`. The network I/O runs without holding the entry lock.
    pub fn load(&self, entry: &CacheEntry) {
        // Waiters would block forever if the entry stayed `Loading` after a panic.
        let _panic_guard = defer(|| {
            if entry.state() == EntryState::Loading {
                entry.complete(Err(LoadError::Panicked));
            }
        });

        let start = Instant::now();
        let result = self.fetch(entry.key());

        match &result {
            Ok(data) => {
                tracing::debug!(url = entry.key(), bytes = data.len(), "loaded from origin");
                metric!(histogram("loader.bytes") = data.len() as u64);
            }
            Err(err) => {
                tracing::warn!(url = entry.key(), error = %err, "failed to load from origin");
                metric!(counter("loader.error") += 1, "kind" => err.kind());
            }
        }
        metric!(
            timer("loader.duration") = start.elapsed(),
            "status" => if result.is_ok() { "done" } else { "error" },
        );

        entry.complete(result);
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("resolver", &self.resolver)
            .field("upstream_port", &self.upstream_port)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

/// Reads until the origin closes the connection.
fn read_response(reader: &mut impl Read) -> Result<Vec<u8>, LoadError> {
    let mut chunk = vec![0; CHUNK_SIZE];
    let mut data = Vec::new();

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(LoadError::Receive(err.to_string())),
        };
        reserve_doubling(&mut data, n)?;
        data.extend_from_slice(&chunk[..n]);
    }

    Ok(data)
}

/// Makes room for `additional` bytes, at least doubling the capacity whenever it grows.
fn reserve_doubling(data: &mut Vec<u8>, additional: usize) -> Result<(), LoadError> {
    let required = data
        .len()
        .checked_add(additional)
        .ok_or(LoadError::OutOfMemory)?;
    if required <= data.capacity() {
        return Ok(());
    }

    let doubled = match data.capacity() {
        0 => additional.saturating_mul(2),
        capacity => capacity.saturating_mul(2),
    };
    let target = doubled.max(required);
    data.try_reserve_exact(target - data.len())
        .map_err(|_| LoadError::OutOfMemory)
}

/// Registry of running loader threads.
///
/// Every load is spawned through here, so shutting down can wait for all loads that may still
/// touch a cache entry. Dropping the registry joins whatever is left.
#[derive(Debug, Default)]
pub struct Loaders {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Loaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts loading `entry` on a new thread.
    ///
    /// Finished loader threads are joined along the way.
    pub fn spawn(&self, loader: Arc<Loader>, entry: Arc<CacheEntry>) -> io::Result<()> {
        let mut handles = self.lock();
        reap(&mut handles);

        let hub = Arc::new(Hub::new_from_top(Hub::current()));
        let handle = thread::Builder::new()
            .name("cacheproxy-loader".into())
            .spawn(move || Hub::run(hub, || loader.load(&entry)))?;
        handles.push(handle);

        metric!(gauge("loader.in_flight") = handles.len() as u64);
        Ok(())
    }

    /// The number of loader threads that have not been joined yet.
    pub fn in_flight(&self) -> usize {
        let mut handles = self.lock();
        reap(&mut handles);
        handles.len()
    }

    /// Waits for every spawned loader to finish.
    pub fn join_all(&self) {
        let handles = std::mem::take(&mut *self.lock());
        if !handles.is_empty() {
            tracing::debug!("waiting for {} loaders to finish", handles.len());
        }
        for handle in handles {
            join(handle);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Loaders {
    fn drop(&mut self) {
        self.join_all();
    }
}

fn reap(handles: &mut Vec<JoinHandle<()>>) {
    let (finished, running) = std::mem::take(handles)
        .into_iter()
        .partition::<Vec<_>, _>(|handle| handle.is_finished());
    *handles = running;
    for handle in finished {
        join(handle);
    }
}

fn join(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        tracing::error!("loader thread panicked");
    }
}
