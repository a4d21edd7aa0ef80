//! # The in-memory response cache
//!
//! The cache maps request URLs to [`CacheEntry`]s. An entry is a small state machine:
//!
//! ```text
//! Required ──claim──▶ Loading ──complete──▶ Done | Error
//! ```
//!
//! Exactly one client observes `Required` and claims the entry; that client starts the single
//! loader for it. Every other client arriving while the entry is `Loading` waits on the entry's
//! condition variable and is woken once the loader completes the entry. Terminal entries are
//! immutable.
//!
//! Entries are reference counted by the [`CacheTable`]. A [`CacheHandle`] is one counted reference,
//! and dropping the last handle removes the entry from the table right away. A failed load
//! therefore poisons its entry only for as long as somebody still holds it; the next request
//! after that starts a fresh fetch.
//!
//! ## Metrics
//!
//! - `cache.entries`: Gauge of live entries, updated on every insertion and removal.

mod entry;
mod error;
mod table;

pub use entry::{CacheEntry, Claim, EntryState, LoadResult};
pub use error::{CacheError, LoadError};
pub use table::{CacheHandle, CacheTable, djb2};
