use crate::error::TaskError;
use crate::pipeline::hole::BatchFlush;
use crate::runtime::telemetry::Telemetry;
use crate::task::retry::RetryPolicy;
use crate::task::unit::Task;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Result of a single [`PendingBatch::flush`] call.
#[derive(Debug)]
pub(crate) enum FlushOutcome {
    Empty,
    Flushed(usize),
    /// The owning task stopped while the flush was being retried. Items stay queued.
    Abandoned(usize),
    /// The retry policy gave up. Items stay queued; the caller decides their fate.
    Failed {
        items: usize,
        error: anyhow::Error,
    },
}

/// Interval whose first tick lands one full period after creation.
pub(crate) fn flush_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Calls `sink.flush` once and counts a failure in `telemetry`.
pub(crate) async fn counted_flush<T, S>(sink: &S, batch: &[T], telemetry: &Telemetry) -> Result<()>
where
    S: BatchFlush<T> + ?Sized,
{
    let result = sink.flush(batch).await;
    if result.is_err() {
        telemetry.record_flush_failure();
    }
    result
}

/// Single-owner queue shared by the processor and hole loops.
pub(crate) struct PendingBatch<T> {
    task: String,
    items: VecDeque<T>,
    batch_size: usize,
    retry: RetryPolicy,
    telemetry: Arc<Telemetry>,
}

impl<T> PendingBatch<T> {
    pub(crate) fn new(task: &Task, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            task: task.name().to_string(),
            items: VecDeque::with_capacity(batch_size),
            batch_size,
            retry: retry.with_task(task),
            telemetry: task.telemetry(),
        }
    }

    pub(crate) fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub(crate) fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.items.extend(items);
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.batch_size
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    /// Flushes the whole queue through `sink` under the retry policy; clears it only on success.
    pub(crate) async fn flush<S>(&mut self, sink: &S) -> FlushOutcome
    where
        S: BatchFlush<T> + ?Sized,
    {
        if self.items.is_empty() {
            return FlushOutcome::Empty;
        }

        let batch: &[T] = self.items.make_contiguous();
        let items = batch.len();
        let telemetry = &self.telemetry;
        let result = self
            .retry
            .run(|| counted_flush(sink, batch, telemetry))
            .await;

        match result {
            Ok(()) => {
                self.items.clear();
                self.telemetry.record_flush(items);
                tracing::debug!(task = %self.task, items, "batch flushed");
                FlushOutcome::Flushed(items)
            }
            Err(err) if TaskError::is_cancelled(&err) => {
                tracing::warn!(
                    task = %self.task,
                    items,
                    "flush abandoned during shutdown"
                );
                FlushOutcome::Abandoned(items)
            }
            Err(error) => FlushOutcome::Failed { items, error },
        }
    }
}
