//! Transform-then-batch stage.
//!
//! Each input goes through [`BatchProcess::process`], which may yield zero or
//! more outputs. Outputs accumulate in a single-owner queue that is flushed
//! when it reaches `batch_size` or when the flush interval elapses, whichever
//! comes first. The interval restarts after every flush.
//!
//! Unlike [`Hole`](crate::pipeline::Hole), a processor never drops data: its
//! flush retry is bounded only by `flush_max_elapsed_time`, which defaults to
//! unlimited. When a bound is configured and spent the stage fails fatally.

use crate::pipeline::batch::{flush_ticker, FlushOutcome, PendingBatch};
use crate::pipeline::hole::BatchFlush;
use crate::runtime::config::TaskConfig;
use crate::runtime::telemetry::Telemetry;
use crate::task::retry::RetryPolicy;
use crate::task::unit::{Task, TaskFuture};
use crate::TaskError;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub trait BatchProcess: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + Sync + 'static;

    /// Turns one input into zero or more outputs. An error skips the input.
    fn process(&self, input: Self::Input) -> TaskFuture<'_, Vec<Self::Output>>;

    /// Persists a batch of outputs. Retried until it succeeds.
    fn flush<'a>(&'a self, batch: &'a [Self::Output]) -> TaskFuture<'a>;
}

struct FlushVia<P>(Arc<P>);

impl<P: BatchProcess> BatchFlush<P::Output> for FlushVia<P> {
    fn flush<'a>(&'a self, batch: &'a [P::Output]) -> TaskFuture<'a> {
        self.0.flush(batch)
    }
}

pub struct BatchProcessor<P: BatchProcess> {
    task: Task,
    handler: Arc<P>,
}

impl<P: BatchProcess> BatchProcessor<P> {
    pub fn new(
        name: impl Into<String>,
        config: &TaskConfig,
        input: mpsc::Receiver<P::Input>,
        handler: P,
    ) -> Self {
        let task = Task::new(name);
        let handler = Arc::new(handler);
        let retry =
            RetryPolicy::flush_from_config(config).named(format!("{}-flush", task.name()));

        let stage = ProcessorLoop {
            name: task.name().to_string(),
            input,
            pending: PendingBatch::new(&task, config.batch_size(), retry),
            handler: handler.clone(),
            flusher: FlushVia(handler.clone()),
            flush_interval: config.flush_interval(),
            stop: task.stop_token(),
            telemetry: task.telemetry(),
        };
        let task = task.with_subtask(move || stage.run());

        Self { task, handler }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }

    pub fn handler(&self) -> &Arc<P> {
        &self.handler
    }

    pub fn start(&self) -> Result<(), TaskError> {
        self.task.start()
    }
}

struct ProcessorLoop<P: BatchProcess> {
    name: String,
    input: mpsc::Receiver<P::Input>,
    pending: PendingBatch<P::Output>,
    handler: Arc<P>,
    flusher: FlushVia<P>,
    flush_interval: Duration,
    stop: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl<P: BatchProcess> ProcessorLoop<P> {
    async fn run(mut self) -> Result<()> {
        let mut ticker = flush_ticker(self.flush_interval);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    tracing::debug!(
                        task = %self.name,
                        queued = self.pending.len(),
                        "processor stopping"
                    );
                    return Ok(());
                }
                item = self.input.recv() => match item {
                    Some(item) => {
                        self.process(item).await;
                        if self.pending.is_full() {
                            self.flush().await?;
                            ticker.reset();
                        }
                    }
                    None => {
                        self.flush().await?;
                        tracing::info!(task = %self.name, "input closed; processor drained");
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.flush().await?;
                    ticker.reset();
                }
            }
        }
    }

    async fn process(&mut self, item: P::Input) {
        match self.handler.process(item).await {
            Ok(outputs) => self.pending.extend(outputs),
            Err(err) => {
                tracing::warn!(task = %self.name, error = %err, "failed to process item; skipping");
                self.telemetry.record_skipped_item();
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self.pending.flush(&self.flusher).await {
            FlushOutcome::Failed { items, error } => {
                tracing::error!(
                    task = %self.name,
                    items,
                    error = %error,
                    "flush retries exhausted"
                );
                Err(error.context(format!("failed to flush {items} items")))
            }
            _ => Ok(()),
        }
    }
}
