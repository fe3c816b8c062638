//! Accumulating sink that decouples receiving from flushing.
//!
//! The receive loop only appends to a shared queue, so a slow flusher never
//! blocks upstream senders; instead the queue grows and a warning is logged
//! once it crosses `high_water_mark`. A repeated subtask drains the queue one
//! batch at a time. A batch whose flush fails is put back at the front of the
//! queue and retried on the next period.

use crate::pipeline::batch::counted_flush;
use crate::pipeline::hole::BatchFlush;
use crate::runtime::config::TaskConfig;
use crate::runtime::telemetry::Telemetry;
use crate::task::lock;
use crate::task::retry::RetryPolicy;
use crate::task::unit::{Repeat, Task};
use crate::TaskError;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type SharedQueue<T> = Arc<Mutex<VecDeque<T>>>;

pub struct SinkTask<T, F> {
    task: Task,
    queue: SharedQueue<T>,
    flusher: Arc<F>,
}

impl<T, F> SinkTask<T, F>
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
        let queue: SharedQueue<T> = Arc::new(Mutex::new(VecDeque::new()));
        let flusher = Arc::new(flusher);

        let intake = Intake {
            name: task.name().to_string(),
            input,
            queue: queue.clone(),
            high_water_mark: config.high_water_mark(),
            stop: task.stop_token(),
        };

        let drainer = Arc::new(Drainer {
            name: task.name().to_string(),
            queue: queue.clone(),
            flusher: flusher.clone(),
            batch_size: config.batch_size(),
            retry: RetryPolicy::from_config(config)
                .named(format!("{}-flush", task.name()))
                .with_task(&task),
            telemetry: task.telemetry(),
        });

        let leftover = queue.clone();
        let name = task.name().to_string();
        let task = task
            .with_subtask(move || intake.run())
            .with_repeated_subtask(config.flush_interval(), move || {
                let drainer = drainer.clone();
                async move { drainer.drain_once().await }
            })
            .with_after_stop(move || async move {
                let remaining = lock(&leftover).len();
                if remaining > 0 {
                    tracing::warn!(task = %name, items = remaining, "sink stopped with unflushed items");
                }
            });

        Self {
            task,
            queue,
            flusher,
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

    /// Items received but not yet flushed.
    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn start(&self) -> Result<(), TaskError> {
        self.task.start()
    }
}

struct Intake<T> {
    name: String,
    input: mpsc::Receiver<T>,
    queue: SharedQueue<T>,
    high_water_mark: usize,
    stop: CancellationToken,
}

impl<T: Send + 'static> Intake<T> {
    async fn run(mut self) -> Result<()> {
        let mut above_mark = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                item = self.input.recv() => item,
            };

            let Some(item) = item else {
                tracing::info!(task = %self.name, "sink input closed");
                return Ok(());
            };

            let len = {
                let mut queue = lock(&self.queue);
                queue.push_back(item);
                queue.len()
            };

            if len > self.high_water_mark {
                if !above_mark {
                    tracing::warn!(
                        task = %self.name,
                        items = len,
                        high_water_mark = self.high_water_mark,
                        "sink queue above high-water mark"
                    );
                }
                above_mark = true;
            } else {
                above_mark = false;
            }
        }
    }
}

struct Drainer<T, F> {
    name: String,
    queue: SharedQueue<T>,
    flusher: Arc<F>,
    batch_size: usize,
    retry: RetryPolicy,
    telemetry: Arc<Telemetry>,
}

impl<T, F> Drainer<T, F>
where
    T: Send + Sync + 'static,
    F: BatchFlush<T> + Send + Sync + 'static,
{
    async fn drain_once(&self) -> Result<Repeat> {
        let batch: Vec<T> = {
            let mut queue = lock(&self.queue);
            let take = queue.len().min(self.batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return Ok(Repeat::AfterPeriod);
        }

        let items = batch.len();
        let flusher = self.flusher.as_ref();
        let telemetry = self.telemetry.as_ref();
        let result = self
            .retry
            .run(|| counted_flush(flusher, &batch, telemetry))
            .await;

        match result {
            Ok(()) => {
                self.telemetry.record_flush(items);
                let remaining = lock(&self.queue).len();
                tracing::debug!(task = %self.name, items, remaining, "sink batch flushed");
                Ok(if remaining >= self.batch_size {
                    Repeat::Immediately
                } else {
                    Repeat::AfterPeriod
                })
            }
            Err(err) => {
                if TaskError::is_cancelled(&err) {
                    tracing::debug!(task = %self.name, items, "flush interrupted by stop; batch requeued");
                } else {
                    tracing::warn!(
                        task = %self.name,
                        items,
                        error = %err,
                        "sink flush failed; batch requeued"
                    );
                }
                let mut queue = lock(&self.queue);
                for item in batch.into_iter().rev() {
                    queue.push_front(item);
                }
                Ok(Repeat::AfterPeriod)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::unit::TaskFuture;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Store {
        offline: AtomicBool,
        batches: Mutex<Vec<Vec<u32>>>,
    }

    impl BatchFlush<u32> for Store {
        fn flush<'a>(&'a self, batch: &'a [u32]) -> TaskFuture<'a> {
            Box::pin(async move {
                if self.offline.load(Ordering::SeqCst) {
                    return Err(anyhow!("store offline"));
                }
                self.batches.lock().unwrap().push(batch.to_vec());
                Ok(())
            })
        }
    }

    fn config(flush_interval: Duration) -> TaskConfig {
        TaskConfig::builder()
            .batch_size(2)
            .high_water_mark(4)
            .flush_interval(flush_interval)
            .retry_initial_interval(Duration::from_millis(2))
            .retry_max_interval(Duration::from_millis(4))
            .retry_max_elapsed_time(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn receiving_never_waits_for_a_slow_flusher() {
        let store = Store::default();
        store.offline.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(1);
        let sink = SinkTask::new("sink", &config(Duration::from_millis(20)), rx, store);
        sink.start().unwrap();

        timeout(Duration::from_secs(1), async {
            for item in 0..10 {
                tx.send(item).await.unwrap();
            }
        })
        .await
        .expect("sends must not block on flush");

        timeout(Duration::from_secs(1), async {
            // Up to one batch may be out of the queue while a flush is retried.
            while sink.queued() < 8 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("every item lands in the queue");

        sink.task().stop_wait(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_batch_is_requeued_in_order() {
        let store = Store::default();
        store.offline.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let sink = SinkTask::new("requeue", &config(Duration::from_millis(20)), rx, store);
        sink.start().unwrap();

        for item in 1..=5 {
            tx.send(item).await.unwrap();
        }

        timeout(Duration::from_secs(1), async {
            while sink.task().telemetry().snapshot().flush_failures < 2 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("flush should fail while offline");

        sink.flusher().offline.store(false, Ordering::SeqCst);
        timeout(Duration::from_secs(2), async {
            while sink.task().telemetry().snapshot().flushed_items < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("everything is flushed once the store recovers");

        let flat: Vec<u32> = sink
            .flusher()
            .batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .copied()
            .collect();
        assert_eq!(flat, vec![1, 2, 3, 4, 5]);
        assert_eq!(sink.queued(), 0);

        sink.task().stop_wait(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn backlog_drains_without_waiting_for_the_period() {
        let period = Duration::from_millis(300);
        let (tx, rx) = mpsc::channel(16);
        let sink = SinkTask::new("backlog", &config(period), rx, Store::default());
        let started = tokio::time::Instant::now();
        sink.start().unwrap();

        for item in 0..6 {
            tx.send(item).await.unwrap();
        }

        timeout(Duration::from_secs(2), async {
            while sink.task().telemetry().snapshot().flushed_items < 6 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("backlog should drain");

        let elapsed = started.elapsed();
        assert!(elapsed < period * 2, "full batches waited a period: {elapsed:?}");
        sink.task().stop_wait(Duration::from_secs(1)).await.unwrap();
    }
}
