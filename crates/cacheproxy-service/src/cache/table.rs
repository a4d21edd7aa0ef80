use std::fmt;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{CacheEntry, CacheError};

/// DJB2 string hash, used to spread URLs across buckets.
pub fn djb2(key: &str) -> u64 {
    key.bytes().fold(5381u64, |hash, byte| {
        hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(u64::from(byte))
    })
}

/// The chains of the table, guarded by the table lock.
struct Buckets {
    chains: Box<[Vec<Arc<CacheEntry>>]>,
    entry_count: usize,
}

impl Buckets {
    fn chain(&self, key: &str) -> usize {
        (djb2(key) % self.chains.len() as u64) as usize
    }
}

struct TableInner {
    buckets: Mutex<Buckets>,
}

impl TableInner {
    fn lock(&self) -> MutexGuard<'_, Buckets> {
        // Chains and counters are only updated in small, non-panicking sections.
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops one reference and unlinks the entry once it is no longer referenced.
    fn release(&self, entry: &Arc<CacheEntry>) {
        let unlinked = {
            let mut buckets = self.lock();
            let previous = entry.ref_count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0, "reference count underflow");
            if previous != 1 {
                return;
            }

            let index = buckets.chain(entry.key());
            let chain = &mut buckets.chains[index];
            let position = chain.iter().position(|e| Arc::ptr_eq(e, entry));
            let unlinked = position.map(|position| chain.swap_remove(position));
            if unlinked.is_some() {
                buckets.entry_count -= 1;
            }
            metric!(gauge("cache.entries") = buckets.entry_count as u64);
            unlinked
        };

        // The table's reference is dropped here, outside of the table lock. A loader may still
        // hold its own reference until it finishes.
        if let Some(entry) = unlinked {
            tracing::trace!(url = entry.key(), state = %entry.state(), "reclaimed cache entry");
        }
    }
}

/// The table of cache entries, keyed by request URL.
///
/// Every key maps to at most one live entry. [`acquire`](Self::acquire) either finds the live
/// entry for a key or creates a fresh one in the `Required` state, which is how concurrent
/// requests for the same URL end up sharing a single load.
///
/// Entries are reclaimed immediately: as soon as the last [`CacheHandle`] of an entry is dropped,
/// the entry is removed from the table and the next `acquire` for its key starts over.
///
/// The table lock only protects the chains and reference counts. It is never held while an entry
/// lock is taken, so a slow origin never stalls lookups of other keys.
#[derive(Clone)]
pub struct CacheTable {
    inner: Arc<TableInner>,
}

impl CacheTable {
    /// Creates an empty table with the given number of buckets.
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is zero.
    pub fn new(buckets: usize) -> Self {
        assert!(buckets > 0, "cache table needs at least one bucket");
        let chains = (0..buckets).map(|_| Vec::new()).collect();
        Self {
            inner: Arc::new(TableInner {
                buckets: Mutex::new(Buckets {
                    chains,
                    entry_count: 0,
                }),
            }),
        }
    }

    /// Returns a handle to the live entry for `key`, creating a `Required` entry if there is none.
    pub fn acquire(&self, key: &str) -> Result<CacheHandle, CacheError> {
        let mut buckets = self.inner.lock();
        let index = buckets.chain(key);

        if let Some(entry) = buckets.chains[index].iter().find(|e| e.key() == key) {
            entry.ref_count.fetch_add(1, Ordering::AcqRel);
            return Ok(CacheHandle {
                entry: Arc::clone(entry),
                table: Arc::clone(&self.inner),
            });
        }

        let mut owned_key = String::new();
        owned_key
            .try_reserve_exact(key.len())
            .map_err(|_| CacheError::OutOfMemory)?;
        owned_key.push_str(key);

        let chain = &mut buckets.chains[index];
        chain.try_reserve(1).map_err(|_| CacheError::OutOfMemory)?;

        let entry = Arc::new(CacheEntry::new(owned_key.into_boxed_str()));
        chain.insert(0, Arc::clone(&entry));
        buckets.entry_count += 1;
        metric!(gauge("cache.entries") = buckets.entry_count as u64);

        Ok(CacheHandle {
            entry,
            table: Arc::clone(&self.inner),
        })
    }

    /// Explicitly releases a handle. Equivalent to dropping it.
    pub fn release(&self, handle: CacheHandle) {
        drop(handle);
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entry_count
    }

    /// Returns `true` if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if there is a live entry for `key`.
    ///
    /// Unlike [`acquire`](Self::acquire) this neither creates an entry nor takes a reference.
    pub fn contains(&self, key: &str) -> bool {
        let buckets = self.inner.lock();
        let index = buckets.chain(key);
        buckets.chains[index].iter().any(|e| e.key() == key)
    }
}

impl fmt::Debug for CacheTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buckets = self.inner.lock();
        f.debug_struct("CacheTable")
            .field("buckets", &buckets.chains.len())
            .field("entries", &buckets.entry_count)
            .finish()
    }
}

/// A counted reference to a [`CacheEntry`].
///
/// Dropping the handle releases the reference; the last one removes the entry from its table.
/// Handles are deliberately not `Clone`: every reference is taken through
/// [`CacheTable::acquire`].
pub struct CacheHandle {
    entry: Arc<CacheEntry>,
    table: Arc<TableInner>,
}

impl CacheHandle {
    /// An uncounted reference to the entry, used by the loader populating it.
    ///
    /// Holding it keeps the entry's memory alive but not its place in the table.
    pub fn shared(&self) -> Arc<CacheEntry> {
        Arc::clone(&self.entry)
    }
}

impl Deref for CacheHandle {
    type Target = CacheEntry;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.table.release(&self.entry);
    }
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheHandle").field(&self.entry).finish()
    }
}
