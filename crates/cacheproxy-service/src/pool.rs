//! Admission control for client connections.
//!
//! The [`ConnectionPool`] owns a fixed number of slots. Every served client occupies one slot and
//! runs on its own thread for the lifetime of the connection. When all slots are occupied,
//! [`ConnectionPool::acquire_slot`] blocks until a connection finishes, which pushes back on the
//! accept loop instead of rejecting clients.

use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use sentry::Hub;

use crate::utils::defer;

/// The lifecycle of a connection slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlotState {
    /// Never used.
    #[default]
    Created,
    /// Reserved for, or serving, a connection.
    Running,
    /// The connection finished. Its thread still has to be joined.
    Done,
}

/// A reserved slot, returned by [`ConnectionPool::acquire_slot`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reserved slot stays occupied until a connection is spawned into it"]
pub struct SlotId(usize);

#[derive(Default)]
struct Slot {
    state: SlotState,
    /// A second handle to the client socket, used to unblock the handler on shutdown.
    client: Option<TcpStream>,
    thread: Option<JoinHandle<()>>,
}

struct Slots {
    slots: Vec<Slot>,
    closed: bool,
}

impl Slots {
    fn running(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Running)
            .count()
    }
}

struct PoolInner {
    slots: Mutex<Slots>,
    released: Condvar,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_slot(&self, id: usize) {
        let mut slots = self.lock();
        let slot = &mut slots.slots[id];
        slot.state = SlotState::Done;
        slot.client = None;

        metric!(gauge("connections.active") = slots.running() as u64);
        drop(slots);

        self.released.notify_all();
    }
}

/// A bounded set of connection slots with one thread per connection.
///
/// Cloning the pool is cheap and yields another handle to the same slots.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "connection pool needs at least one slot");

        let slots = std::iter::repeat_with(Slot::default)
            .take(capacity)
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(Slots {
                    slots,
                    closed: false,
                }),
                released: Condvar::new(),
            }),
        }
    }

    /// The number of slots currently reserved or serving a connection.
    pub fn active(&self) -> usize {
        self.inner.lock().running()
    }

    /// Reserves a free slot, blocking until one becomes available.
    ///
    /// A slot is free if it was never used or its connection is done, in which case the finished
    /// thread is joined first. Returns `None` once the pool is closed.
    pub fn acquire_slot(&self) -> Option<SlotId> {
        let mut slots = self.inner.lock();
        let mut waited = false;

        loop {
            if slots.closed {
                return None;
            }

            let free = slots
                .slots
                .iter()
                .position(|slot| slot.state != SlotState::Running);

            if let Some(id) = free {
                let slot = &mut slots.slots[id];
                slot.state = SlotState::Running;
                let finished = slot.thread.take();
                drop(slots);

                if let Some(thread) = finished {
                    join(thread);
                }
                return Some(SlotId(id));
            }

            if !waited {
                tracing::debug!("all connection slots busy, waiting");
                metric!(counter("connections.waiting") += 1);
                waited = true;
            }
            slots = self
                .inner
                .released
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Serves `stream` on a new thread occupying the reserved `slot`.
    ///
    /// The slot is released when `handler` returns or panics. If the thread cannot be spawned,
    /// the slot is freed right away and the error is returned.
    pub fn spawn<F>(&self, slot: SlotId, stream: TcpStream, handler: F) -> io::Result<()>
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let SlotId(id) = slot;
        let client = match stream.try_clone() {
            Ok(client) => Some(client),
            Err(err) => {
                tracing::warn!(error = %err, "failed to clone client socket");
                None
            }
        };

        // The new thread releases its slot under this lock, so it cannot observe the slot before
        // the handle is stored.
        let mut slots = self.inner.lock();

        let inner = Arc::clone(&self.inner);
        let hub = Arc::new(Hub::new_from_top(Hub::current()));
        let spawned = thread::Builder::new()
            .name("cacheproxy-connection".into())
            .spawn(move || {
                let _release = defer(|| inner.release_slot(id));
                Hub::run(hub, || handler(stream));
            });

        let slot = &mut slots.slots[id];
        match spawned {
            Ok(thread) => {
                slot.thread = Some(thread);
                slot.client = client;
                metric!(gauge("connections.active") = slots.running() as u64);
                Ok(())
            }
            Err(err) => {
                slot.state = SlotState::Created;
                drop(slots);
                self.inner.released.notify_all();
                Err(err)
            }
        }
    }

    /// Stops handing out slots. Callers blocked in [`acquire_slot`](Self::acquire_slot) return
    /// `None`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.released.notify_all();
    }

    /// Closes the pool, disconnects all clients and joins every connection thread.
    pub fn shutdown(&self) {
        let threads: Vec<_> = {
            let mut slots = self.inner.lock();
            slots.closed = true;

            for slot in &mut slots.slots {
                if let Some(client) = slot.client.take() {
                    // The handler may be blocked reading from or writing to this client.
                    let _ = client.shutdown(Shutdown::Both);
                }
            }
            slots
                .slots
                .iter_mut()
                .filter_map(|slot| slot.thread.take())
                .collect()
        };
        self.inner.released.notify_all();

        if !threads.is_empty() {
            tracing::debug!("waiting for {} connections to finish", threads.len());
        }
        for thread in threads {
            join(thread);
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.lock();
        f.debug_struct("ConnectionPool")
            .field("capacity", &slots.slots.len())
            .field("active", &slots.running())
            .field("closed", &slots.closed)
            .finish()
    }
}

fn join(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        tracing::error!("connection thread panicked");
    }
}
