//! Helpers for testing the proxy.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using an [`Origin`], make sure that the server is held until all requests to it have
//!    been made. Dropping it stops the accept loop and joins all of its threads. To avoid this,
//!    assign it to a variable: `let origin = Origin::serve("HELLO");`.
//!
//!  - Origins listen on a random loopback port. Point the proxy at them by resolving every host
//!    to `127.0.0.1` and setting the upstream port to [`Origin::port`].

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the proxy crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cacheproxy=trace,cacheproxy_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// How an [`Origin`] answers requests.
#[derive(Debug, Clone)]
enum Reply {
    /// Write the given bytes and close the connection.
    Body(Vec<u8>),
    /// Close the connection without writing anything.
    Close,
}

/// Builder for an [`Origin`] with non-default behavior.
#[derive(Debug, Clone)]
pub struct OriginBuilder {
    reply: Reply,
    delay: Duration,
}

impl OriginBuilder {
    /// Answer every request with `body`.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.reply = Reply::Body(body.into());
        self
    }

    /// Close every connection without answering.
    pub fn close(mut self) -> Self {
        self.reply = Reply::Close;
        self
    }

    /// Wait this long after reading a request before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Binds to a random loopback port and starts serving.
    pub fn start(self) -> Origin {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(OriginState {
            reply: self.reply,
            delay: self.delay,
            stopped: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        let acceptor = thread::spawn(move || accept_loop(listener, accept_state));

        Origin {
            addr,
            state,
            acceptor: Some(acceptor),
        }
    }
}

#[derive(Debug)]
struct OriginState {
    reply: Reply,
    delay: Duration,
    stopped: AtomicBool,
    connections: AtomicUsize,
    requests: Mutex<Vec<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn accept_loop(listener: TcpListener, state: Arc<OriginState>) {
    for stream in listener.incoming() {
        if state.stopped.load(Ordering::SeqCst) {
            break;
        }
        let Ok(stream) = stream else {
            continue;
        };

        state.connections.fetch_add(1, Ordering::SeqCst);
        let worker_state = Arc::clone(&state);
        let worker = thread::spawn(move || {
            if let Err(err) = answer(stream, &worker_state) {
                tracing::debug!("origin failed to answer: {}", err);
            }
        });
        state
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(worker);
    }
}

fn answer(mut stream: TcpStream, state: &OriginState) -> io::Result<()> {
    let request = read_request(&mut stream)?;
    state
        .requests
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(request);

    thread::sleep(state.delay);

    match &state.reply {
        Reply::Body(body) => stream.write_all(body)?,
        Reply::Close => {}
    }
    stream.shutdown(Shutdown::Both)
}

/// Reads until the end of the request headers, or until the peer stops sending.
fn read_request(stream: &mut TcpStream) -> io::Result<String> {
    let mut request = Vec::new();
    let mut chunk = [0; 1024];
    while !request.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&request).into_owned())
}

/// A scripted origin server that binds to a random loopback port.
///
/// It counts the connections it accepts and records every request it reads. It stops serving and
/// joins all of its threads when dropped.
#[derive(Debug)]
pub struct Origin {
    addr: SocketAddr,
    state: Arc<OriginState>,
    acceptor: Option<JoinHandle<()>>,
}

impl Origin {
    /// Returns a builder for an origin that answers with an empty body and no delay.
    pub fn builder() -> OriginBuilder {
        OriginBuilder {
            reply: Reply::Body(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Starts an origin answering every request with `body`.
    pub fn serve(body: impl Into<Vec<u8>>) -> Self {
        Self::builder().body(body).start()
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// All requests read so far, in the order they were read.
    pub fn requests(&self) -> Vec<String> {
        self.state
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for Origin {
    fn drop(&mut self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        // Wake up the blocking accept.
        let _ = TcpStream::connect(self.addr);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }

        let workers = std::mem::take(
            &mut *self
                .state
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            let _ = worker.join();
        }
    }
}

/// Sends `request` to the proxy at `addr` and reads the response until the proxy closes the
/// connection.
pub fn send(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    stream.write_all(request).unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    response
}

/// Sends a `GET` request for `url` through the proxy at `addr`.
pub fn get(addr: SocketAddr, url: &str) -> Vec<u8> {
    let request = format!("GET {url} HTTP/1.0\r\nHost: proxy\r\n\r\n");
    send(addr, request.as_bytes())
}
