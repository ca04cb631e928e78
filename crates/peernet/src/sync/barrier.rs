//! Pausable dispatch gate.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use tokio::sync::oneshot;

struct State {
    paused: bool,
    gates: VecDeque<oneshot::Sender<()>>,
}

/// Holds submitted operations while paused and lets them through, in
/// submission order, on `resume()`.
///
/// A barrier starts paused. `pause()` only affects operations submitted
/// afterwards; ones already dispatched keep running.
#[derive(Clone)]
pub struct Barrier {
    state: Arc<StdMutex<State>>,
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Barrier {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StdMutex::new(State {
                paused: true,
                gates: VecDeque::new(),
            })),
        }
    }

    fn state(&self) -> StdMutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Number of operations waiting for `resume()`.
    pub fn queued(&self) -> usize {
        self.state().gates.len()
    }

    /// Runs `operation`, first waiting for the barrier to open if paused.
    pub async fn run<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let gate = {
            let mut state = self.state();
            if state.paused {
                let (tx, rx) = oneshot::channel();
                state.gates.push_back(tx);
                Some(rx)
            } else {
                None
            }
        };

        if let Some(gate) = gate {
            // Err means every barrier handle is gone; nothing can hold us.
            let _ = gate.await;
        }

        operation.await
    }

    /// Opens the barrier and dispatches queued operations in order.
    pub fn resume(&self) {
        let gates: Vec<_> = {
            let mut state = self.state();
            state.paused = false;
            state.gates.drain(..).collect()
        };
        for gate in gates {
            let _ = gate.send(());
        }
    }

    /// Closes the barrier for operations submitted from now on.
    pub fn pause(&self) {
        self.state().paused = true;
    }
}
