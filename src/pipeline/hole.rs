//! Terminal batch sink: queue raw inputs, flush them on size or on a timer.
//!
//! A hole is the lossy end of a pipeline. Flushes run under the bounded
//! retry policy; once it gives up the batch is logged as lost and dropped so
//! the stage keeps moving.

use crate::pipeline::batch::{flush_ticker, FlushOutcome, PendingBatch};
use crate::runtime::config::TaskConfig;
use crate::runtime::telemetry::Telemetry;
use crate::task::retry::RetryPolicy;
use crate::task::unit::{Task, TaskFuture};
use crate::TaskError;
use anyhow::Result;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Persists a batch of items. Implementations should be idempotent: a batch
/// whose flush failed part-way is flushed again in full.
pub trait BatchFlush<T> {
    fn flush<'a>(&'a self, batch: &'a [T]) -> TaskFuture<'a>;
}

pub struct Hole<T, F> {
    task: Task,
    flusher: Arc<F>,
    _items: PhantomData<fn(T)>,
}

impl<T, F> Hole<T, F>
where
    T: Send + Sync + 'static,
    F: BatchFlush<T> + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        config: &TaskConfig,
        input: mpsc::Receiver<T>,
        flusher: F,
    ) -> Self {
        let task = Task::new(name);
        let flusher = Arc::new(flusher);
        let retry = RetryPolicy::from_config(config).named(format!("{}-flush", task.name()));

        let stage = HoleLoop {
            name: task.name().to_string(),
            input,
            pending: PendingBatch::new(&task, config.batch_size(), retry),
            flusher: flusher.clone(),
            flush_interval: config.flush_interval(),
            stop: task.stop_token(),
            telemetry: task.telemetry(),
        };
        let task = task.with_subtask(move || async move {
            stage.run().await;
            Ok(())
        });

        Self {
            task,
            flusher,
            _items: PhantomData,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }

    pub fn flusher(&self) -> &Arc<F> {
        &self.flusher
    }

    pub fn start(&self) -> Result<(), TaskError> {
        self.task.start()
    }
}

struct HoleLoop<T, F> {
    name: String,
    input: mpsc::Receiver<T>,
    pending: PendingBatch<T>,
    flusher: Arc<F>,
    flush_interval: Duration,
    stop: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl<T, F> HoleLoop<T, F>
where
    T: Send + Sync + 'static,
    F: BatchFlush<T> + Send + Sync + 'static,
{
    async fn run(mut self) {
        let mut ticker = flush_ticker(self.flush_interval);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    tracing::debug!(task = %self.name, queued = self.pending.len(), "hole stopping");
                    return;
                }
                item = self.input.recv() => match item {
                    Some(item) => {
                        self.pending.push(item);
                        if self.pending.is_full() {
                            self.flush().await;
                            ticker.reset();
                        }
                    }
                    None => {
                        self.flush().await;
                        tracing::info!(task = %self.name, "input closed; hole drained");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.flush().await;
                    ticker.reset();
                }
            }
        }
    }

    async fn flush(&mut self) {
        if let FlushOutcome::Failed { items, error } = self.pending.flush(self.flusher.as_ref()).await
        {
            tracing::error!(
                task = %self.name,
                items,
                error = %error,
                "flush retries exhausted; batch dropped"
            );
            self.telemetry.record_dropped_batch();
            self.pending.clear();
        }
    }
}
