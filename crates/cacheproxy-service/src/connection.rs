//! Serving a single client connection.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use crate::cache::{CacheHandle, CacheTable, Claim, LoadError, LoadResult};
use crate::loader::{Loader, Loaders};
use crate::request::{RequestLine, Status};

/// Everything a connection needs to serve requests.
#[derive(Debug)]
pub struct ProxyState {
    pub cache: CacheTable,
    pub loader: Arc<Loader>,
    pub loaders: Loaders,
    pub max_request_size: usize,
}

/// How a connection was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client sent nothing; nothing was written.
    Closed,
    /// The cached response was relayed.
    Served,
    /// An error status was written.
    Status(Status),
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Closed => "closed",
            Outcome::Served => "served",
            Outcome::Status(Status::BadRequest) => "400",
            Outcome::Status(Status::MethodNotAllowed) => "405",
            Outcome::Status(Status::InternalServerError) => "500",
            Outcome::Status(Status::BadGateway) => "502",
        }
    }
}

/// Handles one client connection from request to response.
///
/// Reads a single chunk containing the request line, serves the URL from the cache, loading it
/// from the origin if this is the first request for it, and writes either the raw origin response
/// or an error status. The stream is closed when this returns.
pub fn handle_connection(state: &ProxyState, mut stream: TcpStream) -> Outcome {
    let peer = stream.peer_addr().ok();
    let outcome = serve(state, &mut stream);

    tracing::debug!(peer = ?peer, outcome = outcome.as_str(), "connection finished");
    metric!(counter("requests") += 1, "outcome" => outcome.as_str());

    outcome
}

fn serve<S: Read + Write>(state: &ProxyState, stream: &mut S) -> Outcome {
    let mut buf = vec![0; state.max_request_size];
    let n = match stream.read(&mut buf) {
        Ok(0) => return Outcome::Closed,
        Ok(n) => n,
        Err(err) => {
            tracing::debug!(error = %err, "failed to read request");
            return Outcome::Closed;
        }
    };

    let request = match RequestLine::parse(&buf[..n]) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!(error = %err, "malformed request");
            return respond_status(stream, Status::BadRequest);
        }
    };

    if request.method != "GET" {
        return respond_status(stream, Status::MethodNotAllowed);
    }

    tracing::info!(method = request.method, url = request.url, "request");

    let entry = match state.cache.acquire(request.url) {
        Ok(entry) => entry,
        Err(err) => {
            tracing::error!(url = request.url, error = %err, "failed to acquire cache entry");
            return respond_status(stream, Status::InternalServerError);
        }
    };

    // The entry is released when it goes out of scope, after the response has been written.
    match lookup(state, &entry) {
        Ok(data) => {
            if let Err(err) = stream.write_all(&data) {
                log_write_error(&err);
            }
            Outcome::Served
        }
        Err(status) => respond_status(stream, status),
    }
}

/// Resolves an acquired entry to its cached bytes, loading it if needed.
fn lookup(state: &ProxyState, entry: &CacheHandle) -> Result<bytes::Bytes, Status> {
    let result = match entry.claim() {
        Claim::Ready(result) => {
            metric!(counter("cache.hit") += 1);
            result
        }
        Claim::Pending => {
            metric!(counter("cache.coalesced") += 1);
            wait(entry)
        }
        Claim::Load => {
            metric!(counter("cache.miss") += 1);
            if let Err(err) = state.loaders.spawn(Arc::clone(&state.loader), entry.shared()) {
                tracing::error!(url = entry.key(), error = %err, "failed to spawn loader");
                entry.complete(Err(LoadError::Spawn(err.to_string())));
                return Err(Status::InternalServerError);
            }
            wait(entry)
        }
    };

    result.map_err(|err| {
        tracing::debug!(url = entry.key(), error = %err, "responding with bad gateway");
        Status::BadGateway
    })
}

fn wait(entry: &CacheHandle) -> LoadResult {
    // A claimed entry is never `Required` again, so this only falls back if the state machine
    // was bypassed.
    entry.wait().unwrap_or_else(|| {
        tracing::error!(url = entry.key(), "entry is not being loaded");
        Err(LoadError::Panicked)
    })
}

fn respond_status<W: Write>(stream: &mut W, status: Status) -> Outcome {
    if let Err(err) = stream.write_all(status.response()) {
        log_write_error(&err);
    }
    Outcome::Status(status)
}

fn log_write_error(err: &io::Error) {
    tracing::debug!(error = %err, "failed to write response");
}
