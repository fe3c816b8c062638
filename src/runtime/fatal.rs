use anyhow::Error as AnyError;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Records the first fatal fault raised by a task's subtasks.
///
/// Later faults are still logged by the caller but never overwrite the captured one,
/// so the error reported at the process boundary is the root cause.
#[derive(Clone, Default)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

#[derive(Default)]
struct FatalInner {
    triggered: AtomicBool,
    captured_error: Mutex<Option<FatalError>>,
}

/// Cloneable wrapper around the captured fault.
#[derive(Clone)]
pub struct FatalError {
    inner: Arc<AnyError>,
}

impl FatalError {
    fn new(inner: AnyError) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl fmt::Debug for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FatalError").field(&self.inner).finish()
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.inner.as_ref(), f)
    }
}

impl std::error::Error for FatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref().as_ref())
    }
}

impl FatalErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures `error` unless another fault was captured first. Returns true for the first fault.
    pub fn trigger(&self, task: &str, error: AnyError) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!(task, error = %error, "additional fatal error after first capture");
            return false;
        }

        tracing::error!(
            task,
            error = %error,
            "fatal subtask error; initiating shutdown"
        );

        let mut slot = self
            .inner
            .captured_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(FatalError::new(error));
        }
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<FatalError> {
        self.inner
            .captured_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
