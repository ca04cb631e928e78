//! Coordination primitives used across the stack.
//!
//! - [`Mutex`]: FIFO mutual exclusion returning a release-on-drop token
//! - [`Semaphore`]: FIFO bounded concurrency gate
//! - [`Deferred`]: single-assignment value, first writer wins
//! - [`Queue`]: unbounded async FIFO
//! - [`Barrier`]: pausable dispatch gate
//! - [`Debounce`]: collapses bursts of calls
//!
//! None of them time out; callers wanting a bounded wait race the future
//! against `tokio::time::timeout`.

mod barrier;
mod debounce;
mod deferred;
mod mutex;
mod queue;
mod semaphore;

pub use barrier::Barrier;
pub use debounce::Debounce;
pub use deferred::Deferred;
pub use mutex::{Mutex, MutexGuard};
pub use queue::Queue;
pub use semaphore::{Semaphore, SemaphorePermit};
