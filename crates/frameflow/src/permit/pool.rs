//! Permit pool backed by a Tokio semaphore.
//!
//! Acquisition blocks only the awaiting dispatch unit. Closing the pool wakes every
//! waiter with `None` so units belonging to a dropped queue do not wait forever.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct Usage {
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
}

impl Usage {
    fn record_acquire(&self) {
        let now = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_use.fetch_max(now, Ordering::AcqRel);
    }
}

/// One unit of concurrency capacity. Returns to its pool when dropped.
#[must_use = "dropping a permit immediately returns its capacity"]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
    usage: Arc<Usage>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.usage.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}

/// Pool of execution permits with a fixed capacity.
pub struct PermitPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    usage: Arc<Usage>,
}

impl PermitPool {
    /// Creates a pool with `capacity` permits. A capacity of zero is clamped to one,
    /// since a zero-permit pool could never run anything.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            usage: Arc::new(Usage {
                in_use: AtomicUsize::new(0),
                peak_in_use: AtomicUsize::new(0),
            }),
        }
    }

    fn wrap(&self, inner: OwnedSemaphorePermit) -> Permit {
        self.usage.record_acquire();
        tracing::trace!(
            available = self.semaphore.available_permits(),
            capacity = self.capacity,
            "Permit acquired"
        );
        Permit {
            _inner: inner,
            usage: Arc::clone(&self.usage),
        }
    }

    /// Waits for a permit. Returns `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<Permit> {
        let inner = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        Some(self.wrap(inner))
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        let inner = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.wrap(inner))
    }

    /// Closes the pool. Pending and future acquisitions return `None`;
    /// permits already handed out stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.usage.in_use.load(Ordering::Acquire)
    }

    /// Highest number of permits held at the same time since the pool was created.
    pub fn peak_in_use(&self) -> usize {
        self.usage.peak_in_use.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PermitPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("in_use", &self.in_use())
            .finish()
    }
}
