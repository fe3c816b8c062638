use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Default interval between metrics snapshots logged by the runner.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters kept per task.
#[derive(Default, Debug)]
pub struct Telemetry {
    flushes: AtomicU64,
    flushed_items: AtomicU64,
    flush_failures: AtomicU64,
    dropped_batches: AtomicU64,
    skipped_items: AtomicU64,
    retries: AtomicU64,
    restarts: AtomicU64,
    fatal_errors: AtomicU64,
}

impl Telemetry {
    pub fn record_flush(&self, items: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed_items
            .fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_batch(&self) {
        self.dropped_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_item(&self) {
        self.skipped_items.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal_error(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_items: self.flushed_items.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            skipped_items: self.skipped_items.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub flushes: u64,
    pub flushed_items: u64,
    pub flush_failures: u64,
    pub dropped_batches: u64,
    pub skipped_items: u64,
    pub retries: u64,
    pub restarts: u64,
    pub fatal_errors: u64,
}

impl TelemetrySnapshot {
    /// Counter increase since `earlier`, saturating at zero.
    pub fn delta(&self, earlier: &TelemetrySnapshot) -> TelemetrySnapshot {
        TelemetrySnapshot {
            flushes: self.flushes.saturating_sub(earlier.flushes),
            flushed_items: self.flushed_items.saturating_sub(earlier.flushed_items),
            flush_failures: self.flush_failures.saturating_sub(earlier.flush_failures),
            dropped_batches: self.dropped_batches.saturating_sub(earlier.dropped_batches),
            skipped_items: self.skipped_items.saturating_sub(earlier.skipped_items),
            retries: self.retries.saturating_sub(earlier.retries),
            restarts: self.restarts.saturating_sub(earlier.restarts),
            fatal_errors: self.fatal_errors.saturating_sub(earlier.fatal_errors),
        }
    }
}

/// Logs one task's counters; `delta` is the change since the previous report.
pub(crate) fn log_snapshot(task: &str, current: &TelemetrySnapshot, delta: &TelemetrySnapshot) {
    tracing::info!(
        target: "chainsync_task::metrics",
        task = %task,
        flushes = current.flushes,
        flushed_items = current.flushed_items,
        new_items = delta.flushed_items,
        flush_failures = current.flush_failures,
        dropped_batches = current.dropped_batches,
        skipped_items = current.skipped_items,
        retries = current.retries,
        restarts = current.restarts,
        fatal_errors = current.fatal_errors,
        "task metrics snapshot"
    );
}

/// In-memory log sink for asserting on emitted events.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl CapturedLogs {
    pub(crate) fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let writer = self.clone();
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish()
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&crate::task::lock(&self.0)).into_owned()
    }
}

#[cfg(test)]
impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        crate::task::lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
