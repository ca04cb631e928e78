//! FIFO counting semaphore with RAII permits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use protocol::error::{ProtocolError, Result};
use tokio::sync::oneshot;

struct State {
    outstanding: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct Inner {
    concurrency: usize,
    state: StdMutex<State>,
}

impl Inner {
    fn state(&self) -> StdMutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the released slot to the oldest live waiter, or return it.
    fn release(&self) {
        let mut state = self.state();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.outstanding -= 1;
    }
}

/// Bounded concurrency gate.
///
/// `lock()` calls are granted in the order they were issued, as soon as fewer
/// than `concurrency` permits are outstanding. Dropping a [`SemaphorePermit`]
/// immediately considers the next queued waiter.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl Semaphore {
    /// Creates a semaphore allowing `concurrency` simultaneous holders.
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency < 1 {
            return Err(ProtocolError::InvalidConcurrency(concurrency));
        }
        Ok(Self::with_concurrency(concurrency))
    }

    pub(crate) fn with_concurrency(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                concurrency,
                state: StdMutex::new(State {
                    outstanding: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Number of permits currently held.
    pub fn outstanding(&self) -> usize {
        self.inner.state().outstanding
    }

    /// Waits for a permit.
    pub async fn lock(&self) -> SemaphorePermit {
        let receiver = {
            let mut state = self.inner.state();
            if state.outstanding < self.inner.concurrency && state.waiters.is_empty() {
                state.outstanding += 1;
                return SemaphorePermit::new(self.inner.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut pending = PendingPermit {
            inner: self.inner.clone(),
            receiver: Some(receiver),
        };
        pending.granted().await
    }
}

/// A queued `lock()` request. If it is dropped after being granted but before
/// being observed, the slot is passed on instead of leaking.
struct PendingPermit {
    inner: Arc<Inner>,
    receiver: Option<oneshot::Receiver<()>>,
}

impl PendingPermit {
    async fn granted(&mut self) -> SemaphorePermit {
        if let Some(receiver) = self.receiver.as_mut() {
            // The sender lives in the semaphore state, which this request
            // keeps alive; it is only consumed by a grant.
            let _ = receiver.await;
        }
        self.receiver = None;
        SemaphorePermit::new(self.inner.clone())
    }
}

impl Drop for PendingPermit {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if receiver.try_recv().is_ok() {
                self.inner.release();
            }
        }
    }
}

/// An acquired semaphore slot. Released on drop.
pub struct SemaphorePermit {
    inner: Option<Arc<Inner>>,
}

impl SemaphorePermit {
    fn new(inner: Arc<Inner>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Releases the permit explicitly.
    pub fn release(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

impl std::fmt::Debug for SemaphorePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphorePermit").finish_non_exhaustive()
    }
}
