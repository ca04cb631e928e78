//! Unbounded async FIFO queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use tokio::sync::oneshot;

struct State<T> {
    values: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

struct Inner<T> {
    state: StdMutex<State<T>>,
}

impl<T> Inner<T> {
    fn state(&self) -> StdMutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unbounded FIFO where `enqueue` never blocks and `dequeue` waits for a
/// value. Pending dequeuers are served in the order they were issued, one
/// value each.
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: StdMutex::new(State {
                    values: VecDeque::new(),
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Appends a value, handing it straight to the oldest pending dequeuer if
    /// there is one.
    pub fn enqueue(&self, value: T) {
        let mut state = self.inner.state();
        let mut value = value;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(value) {
                Ok(()) => return,
                Err(returned) => value = returned,
            }
        }
        state.values.push_back(value);
    }

    /// Takes the oldest value, waiting for one if the queue is empty.
    pub async fn dequeue(&self) -> T {
        loop {
            let receiver = {
                let mut state = self.inner.state();
                if let Some(value) = state.values.pop_front() {
                    return value;
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            let mut pending = PendingDequeue {
                inner: self.inner.clone(),
                receiver: Some(receiver),
            };
            if let Some(value) = pending.received().await {
                return value;
            }
        }
    }

    /// Takes the oldest value without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        self.inner.state().values.pop_front()
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.inner.state().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered dequeuer. If dropped after a value was handed to it but
/// before it was observed, the value goes back to the front of the queue.
struct PendingDequeue<T> {
    inner: Arc<Inner<T>>,
    receiver: Option<oneshot::Receiver<T>>,
}

impl<T> PendingDequeue<T> {
    async fn received(&mut self) -> Option<T> {
        let receiver = self.receiver.as_mut()?;
        let value = receiver.await.ok();
        self.receiver = None;
        value
    }
}

impl<T> Drop for PendingDequeue<T> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if let Ok(value) = receiver.try_recv() {
                self.inner.state().values.push_front(value);
            }
        }
    }
}
