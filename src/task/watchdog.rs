//! Crash-and-respawn supervision for a single task.
//!
//! The watchdog never repairs a unit in place: when the health predicate
//! fails it stops the supervised task, throws it away, and starts a freshly
//! constructed one. Predicates usually report healthy during a grace period
//! after (re)start (see [`Task::uptime`]) so slow warm-ups do not flap.

use crate::runtime::config::TaskConfig;
use crate::runtime::telemetry::Telemetry;
use crate::task::lock;
use crate::task::unit::Task;
use crate::TaskError;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type TaskConstructor = Arc<dyn Fn() -> Result<Task> + Send + Sync>;
pub type HealthCheck = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

pub struct Watchdog {
    task: Task,
    current: Arc<Mutex<Task>>,
}

struct Supervisor {
    name: String,
    current: Arc<Mutex<Task>>,
    constructor: TaskConstructor,
    is_ok: HealthCheck,
    stop_timeout: Duration,
    stop: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl Watchdog {
    /// Builds the first supervised instance immediately; it starts together with the watchdog.
    pub fn new<C, H>(
        name: impl Into<String>,
        config: &TaskConfig,
        constructor: C,
        is_ok: H,
    ) -> Result<Self>
    where
        C: Fn() -> Result<Task> + Send + Sync + 'static,
        H: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        let current = Arc::new(Mutex::new(constructor()?));
        let task = Task::new(name);
        let period = config.watchdog_interval();

        let supervisor = Supervisor {
            name: task.name().to_string(),
            current: current.clone(),
            constructor: Arc::new(constructor),
            is_ok: Arc::new(is_ok),
            stop_timeout: config.stop_timeout(),
            stop: task.stop_token(),
            telemetry: task.telemetry(),
        };

        let on_start = current.clone();
        let on_stop = current.clone();
        let on_drain = current.clone();
        let task = task
            .with_before_start(move || {
                let supervised = lock(&on_start).clone();
                supervised.start()?;
                Ok(())
            })
            .with_on_stop(move || {
                lock(&on_stop).stop();
            })
            .with_after_stop(move || async move {
                let supervised = lock(&on_drain).clone();
                supervised.running_token().cancelled().await;
            })
            .with_subtask(move || supervisor.run(period));

        Ok(Self { task, current })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }

    /// The instance currently under supervision.
    pub fn current(&self) -> Task {
        lock(&self.current).clone()
    }

    pub fn start(&self) -> Result<(), TaskError> {
        self.task.start()
    }

    pub async fn stop_wait(&self, timeout: Duration) -> Result<(), TaskError> {
        self.task.stop_wait(timeout).await
    }
}

impl Supervisor {
    async fn run(self, period: Duration) -> Result<()> {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = ticker.tick() => self.check().await,
            }
        }
    }

    async fn check(&self) {
        let current = lock(&self.current).clone();
        if (self.is_ok)(&current) {
            tracing::debug!(
                task = %self.name,
                supervised = %current.name(),
                "supervised task healthy"
            );
            return;
        }

        tracing::warn!(
            task = %self.name,
            supervised = %current.name(),
            uptime_ms = current.uptime().as_millis() as u64,
            "supervised task unhealthy; restarting"
        );

        if let Err(err) = current.stop_wait(self.stop_timeout).await {
            tracing::warn!(
                task = %self.name,
                supervised = %current.name(),
                error = %err,
                "unhealthy task did not stop cleanly"
            );
        }

        if self.stop.is_cancelled() {
            return;
        }

        let replacement = match (self.constructor)() {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(
                    task = %self.name,
                    error = %err,
                    "failed to construct replacement task; retrying next tick"
                );
                return;
            }
        };

        if let Err(err) = replacement.start() {
            tracing::error!(
                task = %self.name,
                supervised = %replacement.name(),
                error = %err,
                "failed to start replacement task; retrying next tick"
            );
            return;
        }

        *lock(&self.current) = replacement.clone();
        // The on-stop hook may have seen the old instance; make sure the new one stops too.
        if self.stop.is_cancelled() {
            replacement.stop();
        }

        self.telemetry.record_restart();
        tracing::info!(
            task = %self.name,
            supervised = %replacement.name(),
            "supervised task restarted"
        );
    }
}
