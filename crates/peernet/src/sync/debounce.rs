//! Leading-edge debounce with an optional trailing call.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;

type Task = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type ErrorCallback = Box<dyn Fn(anyhow::Error) + Send + Sync>;

struct State {
    window_open: bool,
    trailing: Option<Task>,
}

struct Inner {
    window: Duration,
    dispatch_last: bool,
    on_error: ErrorCallback,
    state: StdMutex<State>,
}

impl Inner {
    fn state(&self) -> StdMutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn execute(&self, task: Task) {
        if let Err(e) = task().await {
            (self.on_error)(e);
        }
    }
}

/// Collapses bursts of `run` calls.
///
/// The first call of a window executes immediately and opens a window of
/// `window`. Calls made while the window is open are dropped, except that
/// with `dispatch_last` the most recent one executes when the window closes.
/// Task errors are passed to the error callback and never reach the caller.
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct Debounce {
    inner: Arc<Inner>,
}

impl Debounce {
    pub fn new(
        window: Duration,
        dispatch_last: bool,
        on_error: impl Fn(anyhow::Error) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                window,
                dispatch_last,
                on_error: Box::new(on_error),
                state: StdMutex::new(State {
                    window_open: false,
                    trailing: None,
                }),
            }),
        }
    }

    /// Submits a task.
    pub fn run<F, Fut>(&self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task: Task = Box::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(task())
        });

        {
            let mut state = self.inner.state();
            if state.window_open {
                if self.inner.dispatch_last {
                    state.trailing = Some(task);
                }
                return;
            }
            state.window_open = true;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.execute(task).await;
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            let trailing = {
                let mut state = inner.state();
                state.window_open = false;
                state.trailing.take()
            };
            if let Some(task) = trailing {
                inner.execute(task).await;
            }
        });
    }
}
