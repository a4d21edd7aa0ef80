use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::LoadError;

/// The load state of a [`CacheEntry`].
///
/// States only ever advance `Required → Loading → {Done, Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Nobody has started fetching the resource yet.
    Required,
    /// A loader is fetching the resource.
    Loading,
    /// The resource was fetched and its bytes are available.
    Done,
    /// Fetching the resource failed.
    Error,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Required => "required",
            EntryState::Loading => "loading",
            EntryState::Done => "done",
            EntryState::Error => "error",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of a load, as observed by every client of an entry.
pub type LoadResult = Result<Bytes, LoadError>;

/// Data guarded by the entry lock.
///
/// The bytes only exist in `Done` and the error only in `Error`, so a terminal entry can never
/// be observed without its contents.
#[derive(Debug)]
enum Contents {
    Required,
    Loading,
    Done(Bytes),
    Error(LoadError),
}

impl Contents {
    fn state(&self) -> EntryState {
        match self {
            Contents::Required => EntryState::Required,
            Contents::Loading => EntryState::Loading,
            Contents::Done(_) => EntryState::Done,
            Contents::Error(_) => EntryState::Error,
        }
    }

    fn result(&self) -> Option<LoadResult> {
        match self {
            Contents::Done(data) => Some(Ok(data.clone())),
            Contents::Error(err) => Some(Err(err.clone())),
            Contents::Required | Contents::Loading => None,
        }
    }
}

/// What a client has to do after looking at an entry, see [`CacheEntry::claim`].
#[derive(Debug)]
pub enum Claim {
    /// The entry is terminal; here is its result.
    Ready(LoadResult),
    /// Another client is loading the entry; [`wait`](CacheEntry::wait) for it.
    Pending,
    /// The caller moved the entry to `Loading` and must start exactly one loader for it.
    Load,
}

/// A single cached resource and its load state machine.
///
/// Entries are created and owned by the [`CacheTable`](super::CacheTable) and are only reachable
/// through counted [`CacheHandle`](super::CacheHandle)s, or by the loader populating them.
pub struct CacheEntry {
    key: Box<str>,
    contents: Mutex<Contents>,
    loaded: Condvar,
    /// Live handles; only modified while holding the table lock.
    pub(super) ref_count: AtomicUsize,
}

impl CacheEntry {
    pub(super) fn new(key: Box<str>) -> Self {
        Self {
            key,
            contents: Mutex::new(Contents::Required),
            loaded: Condvar::new(),
            ref_count: AtomicUsize::new(1),
        }
    }

    /// The request URL this entry caches.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The current state.
    pub fn state(&self) -> EntryState {
        self.lock().state()
    }

    /// The number of live handles to this entry.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// The cached bytes, if the entry is `Done`.
    pub fn data(&self) -> Option<Bytes> {
        match &*self.lock() {
            Contents::Done(data) => Some(data.clone()),
            _ => None,
        }
    }

    /// Inspects the entry and decides the caller's role.
    ///
    /// The first caller observing `Required` moves the entry to `Loading` and is told to
    /// [`Claim::Load`]; it is then responsible for eventually calling [`complete`](Self::complete),
    /// otherwise every waiter blocks forever.
    pub fn claim(&self) -> Claim {
        let mut contents = self.lock();
        match &*contents {
            Contents::Required => {
                *contents = Contents::Loading;
                Claim::Load
            }
            Contents::Loading => Claim::Pending,
            Contents::Done(data) => Claim::Ready(Ok(data.clone())),
            Contents::Error(err) => Claim::Ready(Err(err.clone())),
        }
    }

    /// Blocks until the entry reaches a terminal state and returns its result.
    ///
    /// Must not be called on a `Required` entry, since nothing would ever complete it; this returns
    /// `None` in that case instead of blocking.
    pub fn wait(&self) -> Option<LoadResult> {
        let contents = self
            .loaded
            .wait_while(self.lock(), |contents| matches!(contents, Contents::Loading))
            .unwrap_or_else(PoisonError::into_inner);
        contents.result()
    }

    /// Moves a `Loading` entry to its terminal state and wakes all waiters.
    ///
    /// Returns `false` and leaves the entry untouched if it is not `Loading`.
    pub fn complete(&self, result: LoadResult) -> bool {
        let mut contents = self.lock();
        if !matches!(*contents, Contents::Loading) {
            tracing::error!(
                url = %self.key,
                state = %contents.state(),
                "refusing to complete an entry that is not loading"
            );
            return false;
        }

        *contents = match result {
            Ok(data) => Contents::Done(data),
            Err(err) => Contents::Error(err),
        };
        self.loaded.notify_all();
        true
    }

    fn lock(&self) -> MutexGuard<'_, Contents> {
        // The contents are replaced in single assignments, so they are consistent even if a
        // holder of the lock panicked.
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn entry() -> CacheEntry {
        CacheEntry::new("http://example.com/x".into())
    }

    #[test]
    fn test_new_entry() {
        let entry = entry();
        assert_eq!(entry.key(), "http://example.com/x");
        assert_eq!(entry.state(), EntryState::Required);
        assert_eq!(entry.ref_count(), 1);
        assert_eq!(entry.data(), None);
    }

    #[test]
    fn test_single_loader_claim() {
        let entry = entry();
        assert!(matches!(entry.claim(), Claim::Load));
        assert_eq!(entry.state(), EntryState::Loading);
        assert!(matches!(entry.claim(), Claim::Pending));
        assert!(matches!(entry.claim(), Claim::Pending));
    }

    #[test]
    fn test_complete_done() {
        let entry = entry();
        assert!(matches!(entry.claim(), Claim::Load));
        assert!(entry.complete(Ok(Bytes::from_static(b"HELLO"))));

        assert_eq!(entry.state(), EntryState::Done);
        assert_eq!(entry.data().as_deref(), Some(&b"HELLO"[..]));
        match entry.claim() {
            Claim::Ready(Ok(data)) => assert_eq!(&data[..], b"HELLO"),
            other => panic!("unexpected claim: {other:?}"),
        }
        assert_eq!(entry.wait(), Some(Ok(Bytes::from_static(b"HELLO"))));
    }

    #[test]
    fn test_terminal_is_immutable() {
        let entry = entry();
        assert!(matches!(entry.claim(), Claim::Load));
        assert!(entry.complete(Err(LoadError::EmptyResponse)));

        assert!(!entry.complete(Ok(Bytes::from_static(b"late"))));
        assert_eq!(entry.state(), EntryState::Error);
        assert_eq!(entry.wait(), Some(Err(LoadError::EmptyResponse)));
    }

    #[test]
    fn test_complete_requires_loading() {
        let entry = entry();
        assert!(!entry.complete(Ok(Bytes::from_static(b"x"))));
        assert_eq!(entry.state(), EntryState::Required);
        assert_eq!(entry.wait(), None);
    }

    #[test]
    fn test_waiters_wake_on_complete() {
        let entry = Arc::new(entry());
        assert!(matches!(entry.claim(), Claim::Load));

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let entry = Arc::clone(&entry);
                thread::spawn(move || entry.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert!(entry.complete(Ok(Bytes::from_static(b"payload"))));

        for waiter in waiters {
            assert_eq!(
                waiter.join().unwrap(),
                Some(Ok(Bytes::from_static(b"payload")))
            );
        }
    }
}
