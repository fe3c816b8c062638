use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{idle_task, init_tracing, wait_until};
use anyhow::Result;
use chainsync_task::{TaskConfig, Watchdog};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchdog_replaces_a_stalled_fetcher() -> Result<()> {
    init_tracing();
    let config = TaskConfig::builder()
        .watchdog_interval(Duration::from_millis(25))
        .stop_timeout(Duration::from_secs(1))
        .build()?;

    let generations = Arc::new(AtomicUsize::new(0));
    let counter = generations.clone();
    let grace = Duration::from_millis(60);
    let watchdog = Watchdog::new(
        "fetcher-watchdog",
        &config,
        move || {
            let generation = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(idle_task(format!("fetcher-{generation}")))
        },
        // Only the first generation stalls; later ones stay healthy.
        move |task| task.uptime() < grace || task.name() != "fetcher-1",
    )?;
    let first = watchdog.current();
    watchdog.start()?;

    wait_until(Duration::from_secs(3), "replacement fetcher", || {
        watchdog.current().name() == "fetcher-2"
    })
    .await?;
    tokio::time::sleep(grace * 3).await;

    assert_eq!(generations.load(Ordering::SeqCst), 2);
    assert!(!first.is_running());
    let current = watchdog.current();
    assert!(current.is_running());

    watchdog.stop_wait(Duration::from_secs(2)).await?;
    assert!(!current.is_running());
    assert!(watchdog.task().running_token().is_cancelled());
    Ok(())
}
