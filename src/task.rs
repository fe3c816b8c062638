//! Supervised lifecycle units and the primitives every pipeline stage shares:
//! the bounded worker pool, the retry policy, and the watchdog supervisor.

pub mod pool;
pub mod retry;
pub mod unit;
pub mod watchdog;

pub use pool::WorkerPool;
pub use retry::{RetryClassifier, RetryDisposition, RetryPolicy};
pub use unit::{Repeat, Task, TaskFuture};
pub use watchdog::Watchdog;

use std::sync::{Mutex, MutexGuard};

/// Locks a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
