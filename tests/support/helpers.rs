use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use chainsync_task::{BatchFlush, BatchProcess, Task, TaskFuture};
use once_cell::sync::Lazy;
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Polls `condition` every few milliseconds until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, what: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let outcome = timeout(limit, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    match outcome {
        Ok(()) => Ok(()),
        Err(_) => bail!("timed out after {limit:?} waiting for {what}"),
    }
}

pub async fn bounded<T>(limit: Duration, fut: impl Future<Output = T>) -> Result<T> {
    match timeout(limit, fut).await {
        Ok(value) => Ok(value),
        Err(_) => bail!("operation did not finish within {limit:?}"),
    }
}

/// A task with one subtask that idles until the task is stopped.
pub fn idle_task(name: impl Into<String>) -> Task {
    let task = Task::new(name);
    let stop = task.stop_token();
    task.with_subtask(move || async move {
        stop.cancelled().await;
        Ok(())
    })
}

/// Flusher that records every batch together with the instant it was flushed.
pub struct RecordingFlusher<T> {
    batches: Mutex<Vec<(Instant, Vec<T>)>>,
}

impl<T> Default for RecordingFlusher<T> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> RecordingFlusher<T> {
    pub fn batches(&self) -> Vec<Vec<T>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, batch)| batch.clone())
            .collect()
    }

    pub fn flush_times(&self) -> Vec<Instant> {
        self.batches.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn items(&self) -> Vec<T> {
        self.batches().into_iter().flatten().collect()
    }

    fn record(&self, batch: &[T]) {
        self.batches
            .lock()
            .unwrap()
            .push((Instant::now(), batch.to_vec()));
    }
}

impl<T: Clone + Send + Sync> BatchFlush<T> for RecordingFlusher<T> {
    fn flush<'a>(&'a self, batch: &'a [T]) -> TaskFuture<'a> {
        Box::pin(async move {
            self.record(batch);
            Ok(())
        })
    }
}

/// Processor that doubles every input and records the flushed batches.
#[derive(Default)]
pub struct Doubler {
    pub flushed: Arc<RecordingFlusher<u64>>,
}

impl BatchProcess for Doubler {
    type Input = u64;
    type Output = u64;

    fn process(&self, input: u64) -> TaskFuture<'_, Vec<u64>> {
        Box::pin(async move { Ok(vec![input * 2]) })
    }

    fn flush<'a>(&'a self, batch: &'a [u64]) -> TaskFuture<'a> {
        self.flushed.flush(batch)
    }
}
