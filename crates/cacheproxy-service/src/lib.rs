//! Core of the caching forward proxy.
//!
//! The proxy accepts HTTP/1.0 `GET` requests carrying absolute URLs, fetches the resource from its
//! origin exactly once per live cache entry and relays the raw origin response to every client
//! that asked for it in the meantime.
//!
//! The moving parts, leaves first:
//!
//! - [`cache::CacheEntry`]: one resource plus its load state machine.
//! - [`cache::CacheTable`]: the bucketed table handing out counted [`cache::CacheHandle`]s.
//! - [`loader::Loader`]: fetches a resource from its origin and completes an entry.
//! - [`connection`]: per-client request handling.
//! - [`pool::ConnectionPool`]: bounded slots with one thread per connection.
//! - [`proxy::Proxy`]: the accept loop tying everything together.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod connection;
pub mod loader;
pub mod origin;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod utils;
