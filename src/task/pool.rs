//! Bounded concurrent executor backing `Task::submit_to_worker`.
//!
//! Submissions go through a bounded channel: once `max_queue_size` jobs are
//! waiting, `submit` suspends the caller until a worker frees a slot. That
//! suspension is what turns a slow downstream stage into backpressure on
//! every stage upstream of it.

use crate::error::TaskError;
use crate::runtime::fatal::panic_message;
use crate::task::lock;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

pub(crate) type Job = BoxFuture<'static, ()>;
pub(crate) type FaultHandler = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

type SharedReceiver = Arc<AsyncMutex<mpsc::Receiver<Job>>>;
type WorkerHandles = Arc<Mutex<Vec<(usize, JoinHandle<()>)>>>;

pub struct WorkerPool {
    name: String,
    max_workers: usize,
    max_queue_size: usize,
    started: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Mutex<Option<SharedReceiver>>,
    workers: WorkerHandles,
    on_fault: Option<FaultHandler>,
}

/// Everything a worker loop needs, including the means to replace itself.
#[derive(Clone)]
struct Worker {
    pool: String,
    receiver: SharedReceiver,
    on_fault: Option<FaultHandler>,
    handles: WorkerHandles,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, max_workers: usize, max_queue_size: usize) -> Self {
        Self::with_fault_handler(name, max_workers, max_queue_size, None)
    }

    pub(crate) fn with_fault_handler(
        name: impl Into<String>,
        max_workers: usize,
        max_queue_size: usize,
        on_fault: Option<FaultHandler>,
    ) -> Self {
        let max_workers = max_workers.max(1);
        let max_queue_size = max_queue_size.max(1);
        let (tx, rx) = mpsc::channel(max_queue_size);
        Self {
            name: name.into(),
            max_workers,
            max_queue_size,
            started: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(Arc::new(AsyncMutex::new(rx)))),
            workers: Arc::new(Mutex::new(Vec::new())),
            on_fault,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Spawns the worker loops. Jobs submitted earlier wait in the backlog until then.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(receiver) = lock(&self.receiver).take() else {
            return;
        };

        let worker = Worker {
            pool: self.name.clone(),
            receiver,
            on_fault: self.on_fault.clone(),
            handles: self.workers.clone(),
        };
        for worker_id in 0..self.max_workers {
            worker.spawn(worker_id);
        }
        tracing::debug!(pool = %self.name, workers = self.max_workers, "worker pool started");
    }

    /// Queues `job`, suspending while the backlog is full.
    pub async fn submit(&self, job: Job) -> Result<(), TaskError> {
        let sender = lock(&self.sender).clone();
        let Some(sender) = sender else {
            return Err(TaskError::PoolClosed {
                name: self.name.clone(),
            });
        };

        sender.send(job).await.map_err(|_| TaskError::PoolClosed {
            name: self.name.clone(),
        })
    }

    /// Jobs accepted but not yet picked up by a worker.
    pub fn waiting_queue_size(&self) -> usize {
        lock(&self.sender)
            .as_ref()
            .map(|tx| tx.max_capacity().saturating_sub(tx.capacity()))
            .unwrap_or(0)
    }

    /// Stops accepting work and waits for queued and in-flight jobs to finish.
    pub async fn stop_wait(&self) {
        drop(lock(&self.sender).take());
        // A pool that never started still owns its receiver; dropping it discards the backlog.
        drop(lock(&self.receiver).take());

        // Replacements for panicked workers are registered before the old loop exits.
        loop {
            let workers = std::mem::take(&mut *lock(&self.workers));
            if workers.is_empty() {
                break;
            }
            for (worker_id, handle) in workers {
                if let Err(err) = handle.await {
                    tracing::warn!(
                        pool = %self.name,
                        worker = worker_id,
                        error = %err,
                        "worker loop terminated abnormally"
                    );
                }
            }
        }
        tracing::debug!(pool = %self.name, "worker pool drained");
    }
}

impl Worker {
    fn spawn(&self, worker_id: usize) {
        let worker = self.clone();
        let handle = tokio::spawn(worker.run(worker_id));
        lock(&self.handles).push((worker_id, handle));
    }

    async fn run(self, worker_id: usize) {
        loop {
            let job = {
                let mut rx = self.receiver.lock().await;
                rx.recv().await
            };

            let Some(job) = job else {
                return;
            };

            if let Err(panic_payload) = AssertUnwindSafe(job).catch_unwind().await {
                let panic_msg = panic_message(panic_payload.as_ref());
                tracing::error!(
                    pool = %self.pool,
                    worker = worker_id,
                    panic = %panic_msg,
                    "worker job panicked; replacing worker"
                );
                if let Some(on_fault) = self.on_fault.as_ref() {
                    on_fault(anyhow::anyhow!(
                        "worker {worker_id} of pool {} panicked: {panic_msg}",
                        self.pool
                    ));
                }
                // Keep the pool at full strength; the panic still surfaces on this handle.
                self.spawn(worker_id);
                std::panic::resume_unwind(panic_payload);
            }
        }
    }
}
