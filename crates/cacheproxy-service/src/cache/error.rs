use thiserror::Error;

/// Why an origin fetch failed.
///
/// This is what a cache entry in the `Error` state holds. Every client waiting on that entry
/// observes the same error, so it is cheaply cloneable and carries the details as strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The cache key could not be split into an origin host and path.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// The origin host could not be resolved to an IPv4 address.
    #[error("failed to resolve host: {0}")]
    Resolve(String),
    /// Connecting to the origin failed or timed out.
    #[error("failed to connect to origin: {0}")]
    Connect(String),
    /// Sending the request to the origin failed.
    #[error("failed to send request: {0}")]
    Send(String),
    /// Reading the response from the origin failed or timed out.
    #[error("failed to receive response: {0}")]
    Receive(String),
    /// The response buffer could not be grown.
    #[error("out of memory while buffering response")]
    OutOfMemory,
    /// The origin closed the connection without sending anything.
    #[error("empty response")]
    EmptyResponse,
    /// The loader thread could not be started.
    #[error("failed to spawn loader: {0}")]
    Spawn(String),
    /// The loader thread panicked before completing the entry.
    #[error("loader panicked")]
    Panicked,
}

impl LoadError {
    /// A short, static name of the error kind, suitable as a metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::InvalidUrl(_) => "invalid_url",
            LoadError::Resolve(_) => "resolve",
            LoadError::Connect(_) => "connect",
            LoadError::Send(_) => "send",
            LoadError::Receive(_) => "receive",
            LoadError::OutOfMemory => "out_of_memory",
            LoadError::EmptyResponse => "empty_response",
            LoadError::Spawn(_) => "spawn",
            LoadError::Panicked => "panicked",
        }
    }
}

/// An error acquiring an entry from the [`CacheTable`](super::CacheTable).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Memory for a new entry or its bucket slot could not be reserved.
    #[error("failed to allocate cache entry")]
    OutOfMemory,
}
