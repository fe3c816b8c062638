use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_WORKER_QUEUE_SIZE: usize = 64;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RETRY_INITIAL_INTERVAL_MS: u64 = 100;
const DEFAULT_RETRY_MAX_INTERVAL_SECS: u64 = 10;
const DEFAULT_RETRY_MAX_ELAPSED_SECS: u64 = 60;
const DEFAULT_RETRY_ACCEPTABLE_DURATION_SECS: u64 = 30;
const DEFAULT_HIGH_WATER_MARK: usize = 10_000;
const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 30;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

/// Settings shared by every component built on [`Task`](crate::Task).
///
/// All instances must be constructed via [`TaskConfig::builder`] or [`TaskConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    worker_count: usize,
    worker_queue_size: usize,
    batch_size: usize,
    flush_interval: Duration,
    retry_initial_interval: Duration,
    retry_max_interval: Duration,
    retry_max_elapsed_time: Duration,
    retry_acceptable_duration: Duration,
    flush_max_elapsed_time: Duration,
    high_water_mark: usize,
    watchdog_interval: Duration,
    stop_timeout: Duration,
    metrics_interval: Duration,
}

pub struct TaskConfigParams {
    pub worker_count: usize,
    pub worker_queue_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_initial_interval: Duration,
    pub retry_max_interval: Duration,
    pub retry_max_elapsed_time: Duration,
    pub retry_acceptable_duration: Duration,
    pub flush_max_elapsed_time: Duration,
    pub high_water_mark: usize,
    pub watchdog_interval: Duration,
    pub stop_timeout: Duration,
    pub metrics_interval: Duration,
}

impl Default for TaskConfigParams {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            worker_queue_size: DEFAULT_WORKER_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            retry_initial_interval: Duration::from_millis(DEFAULT_RETRY_INITIAL_INTERVAL_MS),
            retry_max_interval: Duration::from_secs(DEFAULT_RETRY_MAX_INTERVAL_SECS),
            retry_max_elapsed_time: Duration::from_secs(DEFAULT_RETRY_MAX_ELAPSED_SECS),
            retry_acceptable_duration: Duration::from_secs(DEFAULT_RETRY_ACCEPTABLE_DURATION_SECS),
            flush_max_elapsed_time: Duration::ZERO,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            watchdog_interval: Duration::from_secs(DEFAULT_WATCHDOG_INTERVAL_SECS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        // Defaults always satisfy `validate`.
        let TaskConfigParams {
            worker_count,
            worker_queue_size,
            batch_size,
            flush_interval,
            retry_initial_interval,
            retry_max_interval,
            retry_max_elapsed_time,
            retry_acceptable_duration,
            flush_max_elapsed_time,
            high_water_mark,
            watchdog_interval,
            stop_timeout,
            metrics_interval,
        } = TaskConfigParams::default();

        Self {
            worker_count,
            worker_queue_size,
            batch_size,
            flush_interval,
            retry_initial_interval,
            retry_max_interval,
            retry_max_elapsed_time,
            retry_acceptable_duration,
            flush_max_elapsed_time,
            high_water_mark,
            watchdog_interval,
            stop_timeout,
            metrics_interval,
        }
    }
}

impl TaskConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> TaskConfigBuilder {
        TaskConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: TaskConfigParams) -> Result<Self> {
        let TaskConfigParams {
            worker_count,
            worker_queue_size,
            batch_size,
            flush_interval,
            retry_initial_interval,
            retry_max_interval,
            retry_max_elapsed_time,
            retry_acceptable_duration,
            flush_max_elapsed_time,
            high_water_mark,
            watchdog_interval,
            stop_timeout,
            metrics_interval,
        } = params;

        let config = Self {
            worker_count,
            worker_queue_size,
            batch_size,
            flush_interval,
            retry_initial_interval,
            retry_max_interval,
            retry_max_elapsed_time,
            retry_acceptable_duration,
            flush_max_elapsed_time,
            high_water_mark,
            watchdog_interval,
            stop_timeout,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Concurrent workers in a task's worker pool.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Submissions that may wait in the pool backlog before `submit_to_worker` blocks.
    pub fn worker_queue_size(&self) -> usize {
        self.worker_queue_size
    }

    /// Queue length that triggers an immediate flush.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Time-based flush trigger.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn retry_initial_interval(&self) -> Duration {
        self.retry_initial_interval
    }

    pub fn retry_max_interval(&self) -> Duration {
        self.retry_max_interval
    }

    /// Total retry budget for bounded retries. Zero means unlimited.
    pub fn retry_max_elapsed_time(&self) -> Duration {
        self.retry_max_elapsed_time
    }

    /// Attempts slower than this are reported as unacceptable to the retry classifier.
    pub fn retry_acceptable_duration(&self) -> Duration {
        self.retry_acceptable_duration
    }

    /// Retry budget for batch processor flushes. Zero (the default) stalls the
    /// processor until the flush succeeds instead of dropping data.
    pub fn flush_max_elapsed_time(&self) -> Duration {
        self.flush_max_elapsed_time
    }

    /// Queue length above which the accumulating sink warns.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn watchdog_interval(&self) -> Duration {
        self.watchdog_interval
    }

    /// Upper bound on how long `stop_wait` waits for a task to drain.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if self.worker_queue_size == 0 {
            bail!("worker_queue_size must be greater than 0");
        }

        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }

        if self.flush_interval.is_zero() {
            bail!("flush_interval must be greater than 0");
        }

        if self.retry_initial_interval.is_zero() {
            bail!("retry_initial_interval must be greater than 0");
        }

        if self.retry_max_interval < self.retry_initial_interval {
            bail!(
                "retry_max_interval ({:?}) must be at least retry_initial_interval ({:?})",
                self.retry_max_interval,
                self.retry_initial_interval,
            );
        }

        if self.retry_acceptable_duration.is_zero() {
            bail!("retry_acceptable_duration must be greater than 0");
        }

        if self.high_water_mark < self.batch_size {
            bail!(
                "high_water_mark ({}) must be at least batch_size ({})",
                self.high_water_mark,
                self.batch_size,
            );
        }

        if self.watchdog_interval.is_zero() {
            bail!("watchdog_interval must be greater than 0");
        }

        if self.stop_timeout.is_zero() {
            bail!("stop_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct TaskConfigBuilder {
    worker_count: Option<usize>,
    worker_queue_size: Option<usize>,
    batch_size: Option<usize>,
    flush_interval: Option<Duration>,
    retry_initial_interval: Option<Duration>,
    retry_max_interval: Option<Duration>,
    retry_max_elapsed_time: Option<Duration>,
    retry_acceptable_duration: Option<Duration>,
    flush_max_elapsed_time: Option<Duration>,
    high_water_mark: Option<usize>,
    watchdog_interval: Option<Duration>,
    stop_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl TaskConfigBuilder {
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn worker_queue_size(mut self, size: usize) -> Self {
        self.worker_queue_size = Some(size);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn retry_initial_interval(mut self, interval: Duration) -> Self {
        self.retry_initial_interval = Some(interval);
        self
    }

    pub fn retry_max_interval(mut self, interval: Duration) -> Self {
        self.retry_max_interval = Some(interval);
        self
    }

    pub fn retry_max_elapsed_time(mut self, elapsed: Duration) -> Self {
        self.retry_max_elapsed_time = Some(elapsed);
        self
    }

    pub fn retry_acceptable_duration(mut self, duration: Duration) -> Self {
        self.retry_acceptable_duration = Some(duration);
        self
    }

    pub fn flush_max_elapsed_time(mut self, elapsed: Duration) -> Self {
        self.flush_max_elapsed_time = Some(elapsed);
        self
    }

    pub fn high_water_mark(mut self, items: usize) -> Self {
        self.high_water_mark = Some(items);
        self
    }

    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = Some(interval);
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<TaskConfig> {
        let defaults = TaskConfigParams::default();
        let params = TaskConfigParams {
            worker_count: self.worker_count.unwrap_or(defaults.worker_count),
            worker_queue_size: self
                .worker_queue_size
                .unwrap_or(defaults.worker_queue_size),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            flush_interval: self.flush_interval.unwrap_or(defaults.flush_interval),
            retry_initial_interval: self
                .retry_initial_interval
                .unwrap_or(defaults.retry_initial_interval),
            retry_max_interval: self
                .retry_max_interval
                .unwrap_or(defaults.retry_max_interval),
            retry_max_elapsed_time: self
                .retry_max_elapsed_time
                .unwrap_or(defaults.retry_max_elapsed_time),
            retry_acceptable_duration: self
                .retry_acceptable_duration
                .unwrap_or(defaults.retry_acceptable_duration),
            flush_max_elapsed_time: self
                .flush_max_elapsed_time
                .unwrap_or(defaults.flush_max_elapsed_time),
            high_water_mark: self.high_water_mark.unwrap_or(defaults.high_water_mark),
            watchdog_interval: self
                .watchdog_interval
                .unwrap_or(defaults.watchdog_interval),
            stop_timeout: self.stop_timeout.unwrap_or(defaults.stop_timeout),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
        };

        TaskConfig::new(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let config = TaskConfig::builder().build().unwrap();
        assert_eq!(config.worker_count(), DEFAULT_WORKER_COUNT);
        assert_eq!(config.worker_queue_size(), DEFAULT_WORKER_QUEUE_SIZE);
        assert_eq!(config.batch_size(), DEFAULT_BATCH_SIZE);
        assert_eq!(
            config.flush_interval(),
            Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS)
        );
        assert_eq!(config.flush_max_elapsed_time(), Duration::ZERO);
        assert_eq!(
            config.metrics_interval(),
            telemetry::DEFAULT_METRICS_INTERVAL
        );
        assert_eq!(config, TaskConfig::default());
    }

    #[test]
    fn overrides_are_kept() {
        let config = TaskConfig::builder()
            .worker_count(1)
            .worker_queue_size(1)
            .batch_size(5)
            .flush_interval(Duration::from_millis(50))
            .retry_max_elapsed_time(Duration::from_millis(200))
            .retry_max_interval(Duration::from_millis(20))
            .retry_initial_interval(Duration::from_millis(5))
            .high_water_mark(5)
            .stop_timeout(Duration::from_secs(2))
            .build()
            .expect("config should build");

        assert_eq!(config.worker_count(), 1);
        assert_eq!(config.batch_size(), 5);
        assert_eq!(config.retry_max_elapsed_time(), Duration::from_millis(200));
        assert_eq!(config.retry_max_interval(), Duration::from_millis(20));
        assert_eq!(config.high_water_mark(), 5);
        assert_eq!(config.stop_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn zero_elapsed_time_means_unlimited_and_is_valid() {
        let config = TaskConfig::builder()
            .retry_max_elapsed_time(Duration::ZERO)
            .build()
            .expect("zero elapsed budget is allowed");
        assert!(config.retry_max_elapsed_time().is_zero());
    }

    #[test]
    fn validation_catches_invalid_values() {
        let err = TaskConfig::builder().worker_count(0).build().unwrap_err();
        assert!(format!("{err}").contains("worker_count"));

        let err = TaskConfig::builder().batch_size(0).build().unwrap_err();
        assert!(format!("{err}").contains("batch_size"));

        let err = TaskConfig::builder()
            .flush_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("flush_interval"));

        let err = TaskConfig::builder()
            .retry_initial_interval(Duration::from_secs(5))
            .retry_max_interval(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("retry_max_interval"));

        let err = TaskConfig::builder()
            .batch_size(50)
            .high_water_mark(10)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("high_water_mark"));

        let err = TaskConfig::builder()
            .stop_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("stop_timeout"));
    }

    #[test]
    fn direct_constructor_runs_validation() {
        let err = TaskConfig::new(TaskConfigParams {
            worker_queue_size: 0,
            ..TaskConfigParams::default()
        })
        .unwrap_err();
        assert!(format!("{err}").contains("worker_queue_size"));
    }
}
