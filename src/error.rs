//! Error types raised by the task runtime itself.
//!
//! Handler and operation results use `anyhow::Result`; [`TaskError`] covers the
//! failures the runtime produces on its own (lifecycle misuse, pool shutdown,
//! cancellation, stop timeouts, and captured fatal faults).

use crate::runtime::fatal::FatalError;
use std::time::Duration;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// `start` was called on a task that already ran.
    #[error("task {name} was already started")]
    AlreadyStarted { name: String },

    /// A before-start hook refused to let the task start.
    #[error("before-start hook of task {name} failed: {source}")]
    BeforeStart {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// `submit_to_worker` was called on a task without a worker pool.
    #[error("task {name} has no worker pool")]
    NoWorkerPool { name: String },

    /// The worker pool no longer accepts work.
    #[error("worker pool of task {name} is closed")]
    PoolClosed { name: String },

    /// A blocking operation was interrupted by the stop signal.
    #[error("operation cancelled by stop signal")]
    Cancelled,

    /// The running token was not cancelled within the stop timeout.
    #[error("task {name} did not stop within {timeout:?}")]
    StopTimeout { name: String, timeout: Duration },

    /// A subtask failed or panicked; the task shut itself down.
    #[error("task {name} aborted: {source}")]
    Fatal {
        name: String,
        #[source]
        source: FatalError,
    },
}

impl TaskError {
    /// Short snake_case label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::AlreadyStarted { .. } => "task_already_started",
            TaskError::BeforeStart { .. } => "task_before_start",
            TaskError::NoWorkerPool { .. } => "task_no_worker_pool",
            TaskError::PoolClosed { .. } => "task_pool_closed",
            TaskError::Cancelled => "task_cancelled",
            TaskError::StopTimeout { .. } => "task_stop_timeout",
            TaskError::Fatal { .. } => "task_fatal",
        }
    }

    /// Returns true when `err` carries a [`TaskError::Cancelled`] anywhere in its chain.
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<TaskError>(),
                Some(TaskError::Cancelled)
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn cancellation_is_detected_through_context() {
        let err = Err::<(), _>(TaskError::Cancelled)
            .context("flush interrupted")
            .unwrap_err();
        assert!(TaskError::is_cancelled(&err));

        let other = anyhow::anyhow!("connection reset");
        assert!(!TaskError::is_cancelled(&other));
    }

    #[test]
    fn labels_are_stable() {
        let err = TaskError::StopTimeout {
            name: "sink".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.as_label(), "task_stop_timeout");
        assert!(err.to_string().contains("sink"));
    }
}
