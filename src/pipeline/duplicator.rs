//! Fan-out stage: every input is delivered to every output.
//!
//! Sends run in parallel on a pool with one worker per destination, and the
//! next input is not taken until all destinations accepted the current one,
//! so each destination observes items in arrival order.

use crate::task::pool::WorkerPool;
use crate::task::unit::Task;
use crate::TaskError;
use anyhow::{ensure, Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub struct Duplicator<T> {
    task: Task,
    outputs: usize,
    _items: std::marker::PhantomData<fn(T)>,
}

impl<T> Duplicator<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        input: mpsc::Receiver<T>,
        outputs: Vec<mpsc::Sender<T>>,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(!outputs.is_empty(), "duplicator {name} needs at least one output");

        let fanout = outputs.len();
        let task = Task::new(name).with_worker_pool(fanout, fanout);
        let pool = task
            .worker_pool()
            .context("duplicator task has no worker pool")?;

        let fan = FanOut {
            name: task.name().to_string(),
            input,
            outputs,
            pool,
            stop: task.stop_token(),
        };
        let task = task.with_subtask(move || fan.run());

        Ok(Self {
            task,
            outputs: fanout,
            _items: std::marker::PhantomData,
        })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    pub fn start(&self) -> Result<(), TaskError> {
        self.task.start()
    }
}

struct FanOut<T> {
    name: String,
    input: mpsc::Receiver<T>,
    outputs: Vec<mpsc::Sender<T>>,
    pool: Arc<WorkerPool>,
    stop: CancellationToken,
}

impl<T: Clone + Send + 'static> FanOut<T> {
    async fn run(mut self) -> Result<()> {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                item = self.input.recv() => item,
            };

            let Some(item) = item else {
                tracing::info!(task = %self.name, "duplicator input closed");
                // Dropping our senders lets every destination observe the close.
                return Ok(());
            };

            let mut delivered = Vec::with_capacity(self.outputs.len());
            for (index, output) in self.outputs.iter().enumerate() {
                let (done_tx, done_rx) = oneshot::channel();
                let job = deliver(
                    self.name.clone(),
                    index,
                    item.clone(),
                    output.clone(),
                    self.stop.clone(),
                    done_tx,
                );

                let submitted = tokio::select! {
                    _ = self.stop.cancelled() => return Ok(()),
                    submitted = self.pool.submit(Box::pin(job)) => submitted,
                };
                if let Err(err) = submitted {
                    return Err(anyhow::Error::from(err).context("duplicator failed to submit send"));
                }
                delivered.push(done_rx);
            }

            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = join_all(delivered) => {}
            }
        }
    }
}

async fn deliver<T>(
    name: String,
    index: usize,
    item: T,
    output: mpsc::Sender<T>,
    stop: CancellationToken,
    done: oneshot::Sender<()>,
) {
    tokio::select! {
        _ = stop.cancelled() => {}
        sent = output.send(item) => {
            if sent.is_err() {
                tracing::debug!(task = %name, output = index, "duplicator output closed");
            }
        }
    }
    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn every_destination_sees_every_item_in_order() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut receivers = Vec::new();
        let mut senders = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(2);
            senders.push(tx);
            receivers.push(rx);
        }

        let duplicator = Duplicator::new("fanout", in_rx, senders).unwrap();
        assert_eq!(duplicator.outputs(), 3);
        duplicator.start().unwrap();

        let collectors = receivers
            .into_iter()
            .map(|mut rx| {
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(item) = rx.recv().await {
                        seen.push(item);
                    }
                    seen
                })
            })
            .collect::<Vec<_>>();

        for item in 0..20u32 {
            in_tx.send(item).await.unwrap();
        }
        drop(in_tx);

        timeout(Duration::from_secs(2), duplicator.task().wait())
            .await
            .expect("duplicator finishes when input closes")
            .unwrap();

        for collector in collectors {
            let seen = timeout(Duration::from_secs(1), collector)
                .await
                .expect("collector finishes")
                .unwrap();
            assert_eq!(seen, (0..20).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn stalled_destination_does_not_block_stop() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (fast_tx, mut fast_rx) = mpsc::channel(16);
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let duplicator = Duplicator::new("stall", in_rx, vec![fast_tx, slow_tx]).unwrap();
        duplicator.start().unwrap();

        for item in 0..3u32 {
            in_tx.send(item).await.unwrap();
        }
        assert_eq!(fast_rx.recv().await, Some(0));
        assert_eq!(fast_rx.recv().await, Some(1));

        // Item 0 fills the slow destination's only slot, so delivery of item 1 never completes.
        duplicator
            .task()
            .stop_wait(Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[test]
    fn requires_an_output() {
        let (_tx, rx) = mpsc::channel::<u8>(1);
        assert!(Duplicator::new("empty", rx, Vec::new()).is_err());
    }
}
