use std::time::Duration;

use crate::support::helpers::{bounded, idle_task, init_tracing, Doubler};
use anyhow::Result;
use chainsync_task::{BatchProcessor, Runner, TaskConfig, TaskError};
use tokio::sync::{mpsc, oneshot};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_drains_pipeline_on_shutdown() -> Result<()> {
    init_tracing();
    let config = TaskConfig::builder()
        .batch_size(100)
        .flush_interval(Duration::from_secs(60))
        .stop_timeout(Duration::from_secs(2))
        .build()?;

    let (tx, rx) = mpsc::channel(16);
    let doubler = Doubler::default();
    let flushed = doubler.flushed.clone();
    let processor = BatchProcessor::new("double", &config, rx, doubler);
    let root = idle_task("root").with_child(processor.into_task());
    let runner = Runner::new(root, &config);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let feeder = tokio::spawn(async move {
        for item in 1..=3u64 {
            tx.send(item).await?;
        }
        // Closing the input makes the processor flush its partial batch.
        drop(tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(());
        anyhow::Ok(())
    });

    bounded(
        Duration::from_secs(5),
        runner.run_until(async {
            let _ = shutdown_rx.await;
        }),
    )
    .await??;
    feeder.await??;

    assert_eq!(flushed.batches(), vec![vec![2, 4, 6]]);
    assert!(!runner.root().is_running());
    Ok(())
}

#[tokio::test]
async fn runner_reports_stop_timeout() -> Result<()> {
    init_tracing();
    let config = TaskConfig::builder()
        .stop_timeout(Duration::from_millis(50))
        .build()?;
    let root = chainsync_task::Task::new("wedged").with_subtask(|| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    });
    let runner = Runner::new(root, &config);

    let err = bounded(Duration::from_secs(2), runner.run_until(async {}))
        .await?
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TaskError>(),
        Some(TaskError::StopTimeout { .. })
    ));
    Ok(())
}
