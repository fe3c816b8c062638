//! One-to-one transform stage backed by the task's worker pool.
//!
//! Output ordering is not preserved: items finish in whatever order the
//! workers complete them.

use crate::runtime::config::TaskConfig;
use crate::runtime::telemetry::Telemetry;
use crate::task::pool::WorkerPool;
use crate::task::unit::{Task, TaskFuture};
use crate::TaskError;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub trait Map: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Transforms one input. An error drops the item.
    fn map(&self, input: Self::Input) -> TaskFuture<'_, Self::Output>;
}

pub struct Mapper<M: Map> {
    task: Task,
    mapper: Arc<M>,
}

impl<M: Map> Mapper<M> {
    pub fn new(
        name: impl Into<String>,
        config: &TaskConfig,
        input: mpsc::Receiver<M::Input>,
        output: mpsc::Sender<M::Output>,
        mapper: M,
    ) -> Result<Self> {
        let task = Task::new(name).with_worker_pool(config.worker_count(), config.worker_queue_size());
        let pool = task
            .worker_pool()
            .context("mapper task has no worker pool")?;
        let mapper = Arc::new(mapper);

        let dispatch = Dispatch {
            name: task.name().to_string(),
            input,
            output,
            mapper: mapper.clone(),
            pool,
            stop: task.stop_token(),
            telemetry: task.telemetry(),
        };
        let task = task.with_subtask(move || dispatch.run());

        Ok(Self { task, mapper })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }

    pub fn mapper(&self) -> &Arc<M> {
        &self.mapper
    }

    pub fn start(&self) -> Result<(), TaskError> {
        self.task.start()
    }
}

struct Dispatch<M: Map> {
    name: String,
    input: mpsc::Receiver<M::Input>,
    output: mpsc::Sender<M::Output>,
    mapper: Arc<M>,
    pool: Arc<WorkerPool>,
    stop: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl<M: Map> Dispatch<M> {
    async fn run(mut self) -> Result<()> {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                item = self.input.recv() => item,
            };

            let Some(item) = item else {
                tracing::info!(task = %self.name, "mapper input closed");
                return Ok(());
            };

            let job = map_one(
                self.name.clone(),
                item,
                self.mapper.clone(),
                self.output.clone(),
                self.stop.clone(),
                self.telemetry.clone(),
            );

            let submitted = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                submitted = self.pool.submit(Box::pin(job)) => submitted,
            };
            if let Err(err) = submitted {
                return Err(anyhow::Error::from(err).context("mapper failed to submit item"));
            }
        }
    }
}

async fn map_one<M: Map>(
    name: String,
    item: M::Input,
    mapper: Arc<M>,
    output: mpsc::Sender<M::Output>,
    stop: CancellationToken,
    telemetry: Arc<Telemetry>,
) {
    let mapped = match mapper.map(item).await {
        Ok(mapped) => mapped,
        Err(err) => {
            tracing::warn!(task = %name, error = %err, "failed to map item; dropping");
            telemetry.record_skipped_item();
            return;
        }
    };

    tokio::select! {
        _ = stop.cancelled() => {
            tracing::debug!(task = %name, "stopped before mapped item was sent");
        }
        sent = output.send(mapped) => {
            if sent.is_err() {
                tracing::warn!(task = %name, "mapper output closed; dropping item");
            }
        }
    }
}
