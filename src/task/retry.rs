use crate::error::TaskError;
use crate::runtime::config::TaskConfig;
use crate::runtime::telemetry::Telemetry;
use crate::task::unit::Task;
use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Verdict returned by a retry classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Abort,
}

/// Receives the failed attempt's error and whether the attempt finished within the
/// acceptable duration. A slow attempt usually means the underlying client should be
/// reset before the next try.
pub type RetryClassifier = Arc<dyn Fn(&anyhow::Error, bool) -> RetryDisposition + Send + Sync>;

#[derive(Clone)]
struct StopBinding {
    stop: CancellationToken,
    stopping: Arc<AtomicBool>,
    telemetry: Option<Arc<Telemetry>>,
}

/// Exponential backoff around a fallible async operation.
///
/// The delay doubles after every failure up to `max_interval`. A zero
/// `max_elapsed_time` retries until success, a permanent classification, or
/// cancellation.
#[derive(Clone)]
pub struct RetryPolicy {
    name: String,
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed_time: Duration,
    acceptable_duration: Duration,
    classifier: Option<RetryClassifier>,
    binding: Option<StopBinding>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TaskConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            name: "retry".to_string(),
            initial_interval,
            max_interval: max_interval.max(initial_interval),
            max_elapsed_time: Duration::ZERO,
            acceptable_duration: Duration::MAX,
            classifier: None,
            binding: None,
        }
    }

    /// Bounded policy built from the config's `retry_*` settings.
    pub fn from_config(config: &TaskConfig) -> Self {
        Self::new(config.retry_initial_interval(), config.retry_max_interval())
            .with_max_elapsed_time(config.retry_max_elapsed_time())
            .with_acceptable_duration(config.retry_acceptable_duration())
    }

    /// Policy used by the batch processor: same intervals, `flush_max_elapsed_time` budget.
    pub fn flush_from_config(config: &TaskConfig) -> Self {
        Self::from_config(config).with_max_elapsed_time(config.flush_max_elapsed_time())
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval.max(self.initial_interval);
        self
    }

    pub fn with_max_elapsed_time(mut self, max_elapsed_time: Duration) -> Self {
        self.max_elapsed_time = max_elapsed_time;
        self
    }

    pub fn with_acceptable_duration(mut self, acceptable: Duration) -> Self {
        self.acceptable_duration = acceptable;
        self
    }

    pub fn with_classifier<C>(mut self, classifier: C) -> Self
    where
        C: Fn(&anyhow::Error, bool) -> RetryDisposition + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Ties the policy to `task`: backoff sleeps end when the task stops, cancellation
    /// errors become permanent once it is stopping, and retries are counted in its telemetry.
    pub fn with_task(self, task: &Task) -> Self {
        self.with_stop_signal(
            task.stop_token(),
            task.stopping_flag(),
            Some(task.telemetry()),
        )
    }

    pub(crate) fn with_stop_signal(
        mut self,
        stop: CancellationToken,
        stopping: Arc<AtomicBool>,
        telemetry: Option<Arc<Telemetry>>,
    ) -> Self {
        self.binding = Some(StopBinding {
            stop,
            stopping,
            telemetry,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_elapsed_time(&self) -> Duration {
        self.max_elapsed_time
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    fn is_stopping(&self) -> bool {
        self.binding
            .as_ref()
            .map(|binding| binding.stopping.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn classify(&self, err: &anyhow::Error, acceptable: bool) -> RetryDisposition {
        if TaskError::is_cancelled(err) {
            return if self.is_stopping() {
                RetryDisposition::Abort
            } else {
                RetryDisposition::Retry
            };
        }

        match self.classifier.as_ref() {
            Some(classifier) => classifier(err, acceptable),
            None => RetryDisposition::Retry,
        }
    }

    /// Invokes `operation` until it succeeds or the policy gives up, returning the last error.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut backoff = self.initial_interval;
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let acceptable = attempt_started.elapsed() <= self.acceptable_duration;
            if self.classify(&err, acceptable) == RetryDisposition::Abort {
                tracing::debug!(
                    retry = %self.name,
                    attempt,
                    error = %err,
                    "permanent error; not retrying"
                );
                return Err(err);
            }

            if !self.max_elapsed_time.is_zero()
                && started.elapsed().saturating_add(backoff) > self.max_elapsed_time
            {
                tracing::error!(
                    retry = %self.name,
                    attempt,
                    error = %err,
                    max_elapsed_ms = duration_to_millis(self.max_elapsed_time),
                    "retries exhausted"
                );
                return Err(err);
            }

            tracing::warn!(
                retry = %self.name,
                attempt,
                backoff_ms = duration_to_millis(backoff),
                acceptable,
                error = %err,
                "operation failed; retrying"
            );
            if let Some(telemetry) = self
                .binding
                .as_ref()
                .and_then(|binding| binding.telemetry.as_ref())
            {
                telemetry.record_retry();
            }

            self.sleep_with_cancellation(backoff).await?;
            backoff = next_backoff(backoff, self.max_interval);
        }
    }

    async fn sleep_with_cancellation(&self, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            yield_now().await;
            return Ok(());
        }

        if let Some(binding) = self.binding.as_ref() {
            tokio::select! {
                _ = binding.stop.cancelled() => Err(TaskError::Cancelled.into()),
                _ = sleep(delay) => Ok(()),
            }
        } else {
            sleep(delay).await;
            Ok(())
        }
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_backoff {
        next = max_backoff;
    }
    next
}

fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
