//! The supervised lifecycle unit every pipeline stage is built on.
//!
//! A [`Task`] owns two cancellation tokens with a strict happens-before
//! relationship:
//!
//! ```text
//! stop()  ──► children.stop() ──► stopping = true ──► stop token cancelled ──► on-stop hooks
//!                                                          │
//!                    subtasks observe the stop token ◄─────┘
//!                                │
//!                                ▼
//! joiner: all subtasks returned ──► all children running ──► after-stop hooks ──► running token
//!                                   tokens cancelled         (pool drain)          cancelled
//! ```
//!
//! The stop token means "shutdown requested", the running token means
//! "nothing executes under this unit anymore".

use crate::error::TaskError;
use crate::runtime::fatal::{panic_message, FatalError, FatalErrorHandler};
use crate::runtime::telemetry::{log_snapshot, Telemetry, TelemetrySnapshot};
use crate::task::lock;
use crate::task::pool::{FaultHandler, WorkerPool};
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{yield_now, JoinHandle};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

pub type TaskFuture<'a, T = ()> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

type Subtask = Box<dyn FnOnce() -> TaskFuture<'static> + Send>;
type BeforeStartHook = Box<dyn FnOnce() -> Result<()> + Send>;
type OnStopHook = Box<dyn FnOnce() + Send>;
type AfterStopHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// What a repeated subtask wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Run again right away (e.g. more work is still queued).
    Immediately,
    /// Sleep for the configured period first.
    AfterPeriod,
}

#[derive(Default)]
struct Registry {
    before_start: Vec<BeforeStartHook>,
    on_stop: Vec<OnStopHook>,
    after_stop: Vec<AfterStopHook>,
    subtasks: Vec<Subtask>,
}

struct TaskInner {
    name: String,
    stop: CancellationToken,
    running: CancellationToken,
    stopping: Arc<AtomicBool>,
    stop_once: AtomicBool,
    started: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    registry: Mutex<Registry>,
    children: Mutex<Vec<Task>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    fatal: FatalErrorHandler,
    telemetry: Arc<Telemetry>,
}

/// A named unit of supervised concurrent work. Cloning yields another handle to the same unit.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("stopping", &self.is_stopping())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                stop: CancellationToken::new(),
                running: CancellationToken::new(),
                stopping: Arc::new(AtomicBool::new(false)),
                stop_once: AtomicBool::new(false),
                started: AtomicBool::new(false),
                started_at: Mutex::new(None),
                registry: Mutex::new(Registry::default()),
                children: Mutex::new(Vec::new()),
                pool: Mutex::new(None),
                fatal: FatalErrorHandler::new(),
                telemetry: Arc::new(Telemetry::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Cancelled as soon as `stop` is invoked.
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    /// Cancelled once every child, subtask, and the worker pool have terminated.
    pub fn running_token(&self) -> CancellationToken {
        self.inner.running.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn stopping_flag(&self) -> Arc<AtomicBool> {
        self.inner.stopping.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.running.is_cancelled()
    }

    /// Time since `start`; zero if the task never started.
    pub fn uptime(&self) -> Duration {
        lock(&self.inner.started_at)
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.inner.telemetry.clone()
    }

    pub fn children(&self) -> Vec<Task> {
        lock(&self.inner.children).clone()
    }

    pub fn worker_pool(&self) -> Option<Arc<WorkerPool>> {
        lock(&self.inner.pool).clone()
    }

    /// Adds a child that is started before and stopped before this task's own subtasks.
    pub fn with_child(self, child: Task) -> Self {
        self.warn_if_started("child");
        lock(&self.inner.children).push(child);
        self
    }

    pub fn with_before_start<F>(self, hook: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.warn_if_started("before-start hook");
        lock(&self.inner.registry).before_start.push(Box::new(hook));
        self
    }

    /// Hook run synchronously inside `stop`, after the stop token is cancelled.
    pub fn with_on_stop<F>(self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.warn_if_started("on-stop hook");
        lock(&self.inner.registry).on_stop.push(Box::new(hook));
        self
    }

    /// Hook run once every subtask and child has finished, before the running token is cancelled.
    pub fn with_after_stop<F, Fut>(self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.warn_if_started("after-stop hook");
        lock(&self.inner.registry)
            .after_stop
            .push(Box::new(move || hook().boxed()));
        self
    }

    /// Installs a bounded worker pool that is drained before the running token is cancelled.
    pub fn with_worker_pool(self, max_workers: usize, max_queue_size: usize) -> Self {
        self.warn_if_started("worker pool");
        let weak = Arc::downgrade(&self.inner);
        let on_fault: FaultHandler = Arc::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                Task { inner }.fail(err);
            }
        });
        let pool = Arc::new(WorkerPool::with_fault_handler(
            format!("{}-pool", self.inner.name),
            max_workers,
            max_queue_size,
            Some(on_fault),
        ));
        *lock(&self.inner.pool) = Some(pool.clone());

        lock(&self.inner.registry).after_stop.push(Box::new(move || {
            async move { pool.stop_wait().await }.boxed()
        }));
        self
    }

    /// Runs `subtask` concurrently once the task starts.
    ///
    /// Returning an error or panicking is fatal: the fault is logged and captured, the
    /// task stops itself, and a panic is re-raised.
    pub fn with_subtask<F, Fut>(self, subtask: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.warn_if_started("subtask");
        lock(&self.inner.registry)
            .subtasks
            .push(Box::new(move || subtask().boxed()));
        self
    }

    /// Calls `f` every `period` until the task stops.
    pub fn with_periodic_subtask<F, Fut>(self, period: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.with_repeated_subtask(period, move || {
            let run = f();
            async move { run.await.map(|()| Repeat::AfterPeriod) }
        })
    }

    /// Calls `f` repeatedly; `Repeat::Immediately` skips the wait so queued work can be drained.
    pub fn with_repeated_subtask<F, Fut>(self, period: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Repeat>> + Send + 'static,
    {
        let stop = self.stop_token();
        self.with_subtask(move || repeat_until_stopped(stop, period, f))
    }

    /// Periodically logs this task's telemetry counters.
    pub fn with_metrics_reporter(self, interval: Duration) -> Self {
        let name = self.inner.name.clone();
        let telemetry = self.telemetry();
        let last = Arc::new(Mutex::new(TelemetrySnapshot::default()));

        self.with_periodic_subtask(interval, move || {
            let current = telemetry.snapshot();
            let delta = {
                let mut last = lock(&last);
                let delta = current.delta(&last);
                *last = current;
                delta
            };
            log_snapshot(&name, &current, &delta);
            async { Ok(()) }
        })
    }

    /// Submits `job` to the worker pool, suspending while its backlog is full.
    pub async fn submit_to_worker<F>(&self, job: F) -> Result<(), TaskError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pool = self.worker_pool().ok_or_else(|| TaskError::NoWorkerPool {
            name: self.inner.name.clone(),
        })?;

        tokio::select! {
            _ = self.inner.stop.cancelled() => Err(TaskError::Cancelled),
            result = pool.submit(job.boxed()) => result,
        }
    }

    /// Runs before-start hooks, starts children, spawns subtasks and the joiner.
    pub fn start(&self) -> Result<(), TaskError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(TaskError::AlreadyStarted {
                name: self.inner.name.clone(),
            });
        }
        *lock(&self.inner.started_at) = Some(Instant::now());

        let (before_start, subtasks) = {
            let mut registry = lock(&self.inner.registry);
            (
                std::mem::take(&mut registry.before_start),
                std::mem::take(&mut registry.subtasks),
            )
        };

        let children = self.children();
        if let Err(err) = self.start_children(before_start, &children) {
            self.abort_start(children, &err);
            return Err(err);
        }

        if let Some(pool) = self.worker_pool() {
            pool.start();
        }

        let subtask_count = subtasks.len();
        let handles = subtasks
            .into_iter()
            .enumerate()
            .map(|(index, subtask)| self.spawn_subtask(index, subtask))
            .collect::<Vec<_>>();

        tokio::spawn(self.clone().join(children, handles));

        tracing::info!(
            task = %self.inner.name,
            subtasks = subtask_count,
            "task started"
        );
        Ok(())
    }

    fn start_children(
        &self,
        before_start: Vec<BeforeStartHook>,
        children: &[Task],
    ) -> Result<(), TaskError> {
        for hook in before_start {
            hook().map_err(|source| TaskError::BeforeStart {
                name: self.inner.name.clone(),
                source,
            })?;
        }

        for child in children {
            child.start()?;
        }
        Ok(())
    }

    /// Unwinds a failed start: children that already started are stopped and
    /// the running token is cancelled once they have drained.
    fn abort_start(&self, children: Vec<Task>, err: &TaskError) {
        tracing::warn!(task = %self.inner.name, error = %err, "task failed to start");
        self.stop();
        tokio::spawn(self.clone().join(children, Vec::new()));
    }

    fn spawn_subtask(&self, index: usize, subtask: Subtask) -> JoinHandle<()> {
        let task = self.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(async move { subtask().await })
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(
                        task = %task.inner.name,
                        subtask = index,
                        error = %err,
                        "subtask exited with error"
                    );
                    task.fail(err.context(format!("subtask {index} exited with error")));
                }
                Err(panic_payload) => {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    tracing::error!(
                        task = %task.inner.name,
                        subtask = index,
                        panic = %panic_msg,
                        "subtask panicked"
                    );
                    task.fail(anyhow::anyhow!("subtask {index} panicked: {panic_msg}"));
                    std::panic::resume_unwind(panic_payload);
                }
            }
        })
    }

    async fn join(self, children: Vec<Task>, handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            if let Err(err) = handle.await {
                // Panics were already captured by `fail`; only unexpected aborts are new.
                if !err.is_panic() {
                    tracing::warn!(task = %self.inner.name, error = %err, "subtask aborted");
                }
            }
        }

        for child in &children {
            child.inner.running.cancelled().await;
        }

        let after_stop = std::mem::take(&mut lock(&self.inner.registry).after_stop);
        for hook in after_stop {
            hook().await;
        }

        self.inner.running.cancel();
        tracing::info!(task = %self.inner.name, "task stopped");
    }

    fn fail(&self, err: anyhow::Error) {
        self.inner.telemetry.record_fatal_error();
        self.inner.fatal.trigger(&self.inner.name, err);
        self.stop();
    }

    /// Requests shutdown. Only the first call has any effect.
    pub fn stop(&self) {
        if self.inner.stop_once.swap(true, Ordering::SeqCst) {
            return;
        }

        for child in self.children() {
            child.stop();
        }

        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.stop.cancel();

        let on_stop = std::mem::take(&mut lock(&self.inner.registry).on_stop);
        for hook in on_stop {
            hook();
        }

        // A task that never started has nothing to join.
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.running.cancel();
        }

        tracing::debug!(task = %self.inner.name, "task stop requested");
    }

    /// Stops the task and waits up to `timeout` for it to drain.
    pub async fn stop_wait(&self, timeout: Duration) -> Result<(), TaskError> {
        self.stop();

        match tokio::time::timeout(timeout, self.inner.running.cancelled()).await {
            Ok(()) => {
                tracing::debug!(task = %self.inner.name, "task drained after stop");
            }
            Err(_) => {
                tracing::warn!(
                    task = %self.inner.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "task did not drain before stop timeout"
                );
                return Err(TaskError::StopTimeout {
                    name: self.inner.name.clone(),
                    timeout,
                });
            }
        }

        self.check_fatal()
    }

    /// Waits for the running token without requesting a stop.
    pub async fn wait(&self) -> Result<(), TaskError> {
        self.inner.running.cancelled().await;
        self.check_fatal()
    }

    /// The first fatal fault captured by this task or any descendant.
    pub fn fatal_error(&self) -> Option<(String, FatalError)> {
        if let Some(err) = self.inner.fatal.error() {
            return Some((self.inner.name.clone(), err));
        }
        self.children()
            .iter()
            .find_map(|child| child.fatal_error())
    }

    fn check_fatal(&self) -> Result<(), TaskError> {
        match self.fatal_error() {
            Some((name, source)) => Err(TaskError::Fatal { name, source }),
            None => Ok(()),
        }
    }

    fn warn_if_started(&self, what: &'static str) {
        if self.inner.started.load(Ordering::SeqCst) {
            tracing::warn!(
                task = %self.inner.name,
                what,
                "registered after start; it may never run"
            );
        }
    }
}

async fn repeat_until_stopped<F, Fut>(stop: CancellationToken, period: Duration, f: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Repeat>>,
{
    loop {
        if stop.is_cancelled() {
            return Ok(());
        }

        if f().await? == Repeat::Immediately {
            yield_now().await;
            continue;
        }

        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = sleep(period) => {}
        }
    }
}
