use crate::runtime::config::TaskConfig;
use crate::runtime::telemetry::{log_snapshot, TelemetrySnapshot};
use crate::task::unit::Task;
use anyhow::Result;
use std::time::Duration;
use tokio::signal;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Owns the root task of a process and turns its outcome into the process result.
pub struct Runner {
    root: Task,
    stop_timeout: Duration,
    metrics_interval: Duration,
}

impl Runner {
    pub fn new(root: Task, config: &TaskConfig) -> Self {
        Self {
            root,
            stop_timeout: config.stop_timeout(),
            metrics_interval: config.metrics_interval(),
        }
    }

    pub fn root(&self) -> &Task {
        &self.root
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Telemetry of the root and every descendant, depth-first.
    pub fn tree_snapshot(&self) -> Vec<(String, TelemetrySnapshot)> {
        let mut out = Vec::new();
        collect_snapshots(&self.root, &mut out);
        out
    }

    /// Starts the root task and waits for Ctrl-C (SIGINT) or for the task to finish on its own.
    ///
    /// Either way the task is stopped and drained; a fatal fault captured anywhere in the
    /// tree, or a drain that outlives the stop timeout, is returned as an error.
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Like [`Runner::run_until_ctrl_c`] with a caller-provided shutdown trigger.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.root.start()?;
        tracing::info!(task = %self.root.name(), "runner started; waiting for shutdown signal");

        let running = self.root.running_token();
        let mut ticker = interval_at(Instant::now() + self.metrics_interval, self.metrics_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Vec::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(task = %self.root.name(), "shutdown signal received");
                    break;
                }
                _ = running.cancelled() => {
                    tracing::info!(task = %self.root.name(), "root task finished on its own");
                    break;
                }
                _ = ticker.tick() => self.report_metrics(&mut last),
            }
        }

        self.root.stop_wait(self.stop_timeout).await?;
        tracing::info!(task = %self.root.name(), "runner stopped cleanly");
        Ok(())
    }

    fn report_metrics(&self, last: &mut Vec<TelemetrySnapshot>) {
        let snapshots = self.tree_snapshot();
        last.resize(snapshots.len(), TelemetrySnapshot::default());
        for ((name, current), previous) in snapshots.iter().zip(last.iter_mut()) {
            log_snapshot(name, current, &current.delta(previous));
            *previous = *current;
        }
    }
}

fn collect_snapshots(task: &Task, out: &mut Vec<(String, TelemetrySnapshot)>) {
    out.push((task.name().to_string(), task.telemetry().snapshot()));
    for child in task.children() {
        collect_snapshots(&child, out);
    }
}
