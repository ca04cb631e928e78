//! FIFO mutual-exclusion lock.

use super::semaphore::{Semaphore, SemaphorePermit};

/// Mutual exclusion with strict request-order fairness.
///
/// The lock guards no data; it serialises critical sections. A
/// [`MutexGuard`] is the token of exclusive access and must be dropped (or
/// released) on every exit path.
#[derive(Clone)]
pub struct Mutex {
    semaphore: Semaphore,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::with_concurrency(1),
        }
    }

    /// Waits until exclusive access is granted.
    pub async fn lock(&self) -> MutexGuard {
        MutexGuard {
            _permit: self.semaphore.lock().await,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore.outstanding() > 0
    }
}

/// Exclusive access token returned by [`Mutex::lock`].
#[derive(Debug)]
pub struct MutexGuard {
    _permit: SemaphorePermit,
}

impl MutexGuard {
    /// Releases the lock explicitly.
    pub fn release(self) {
        drop(self);
    }
}
