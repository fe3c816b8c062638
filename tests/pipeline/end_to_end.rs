use std::time::Duration;

use crate::support::helpers::{bounded, init_tracing, wait_until, Doubler, RecordingFlusher};
use anyhow::{anyhow, bail, Result};
use chainsync_task::{
    BatchProcessor, Duplicator, Map, Mapper, SinkTask, Task, TaskConfig, TaskFuture,
};
use tokio::sync::mpsc;

#[tokio::test(start_paused = true)]
async fn processor_flushes_on_size_then_on_interval() -> Result<()> {
    init_tracing();
    let config = TaskConfig::builder()
        .batch_size(3)
        .flush_interval(Duration::from_secs(1))
        .build()?;

    let (tx, rx) = mpsc::channel(8);
    let doubler = Doubler::default();
    let flushed = doubler.flushed.clone();
    let processor = BatchProcessor::new("doubler", &config, rx, doubler);
    processor.start()?;

    for item in 1..=4u64 {
        tx.send(item).await?;
    }

    wait_until(Duration::from_secs(5), "two flushes", || {
        flushed.batches().len() == 2
    })
    .await?;

    assert_eq!(flushed.batches(), vec![vec![2, 4, 6], vec![8]]);
    let times = flushed.flush_times();
    assert!(times[1] - times[0] >= Duration::from_secs(1));

    processor.task().stop_wait(Duration::from_secs(1)).await?;
    Ok(())
}

struct ParseHeight;

impl Map for ParseHeight {
    type Input = String;
    type Output = u64;

    fn map(&self, input: String) -> TaskFuture<'_, u64> {
        Box::pin(async move {
            match input.trim().parse::<u64>() {
                Ok(height) => Ok(height),
                Err(err) => bail!("invalid height {input:?}: {err}"),
            }
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chained_stages_drain_when_the_source_closes() -> Result<()> {
    init_tracing();
    let config = TaskConfig::builder()
        .worker_count(2)
        .worker_queue_size(4)
        .batch_size(4)
        .flush_interval(Duration::from_millis(50))
        .build()?;

    let (source_tx, source_rx) = mpsc::channel::<String>(8);
    let (parsed_tx, parsed_rx) = mpsc::channel(8);
    let (left_tx, left_rx) = mpsc::channel(8);
    let (right_tx, right_rx) = mpsc::channel(8);

    let mapper = Mapper::new("parse", &config, source_rx, parsed_tx, ParseHeight)?;
    let duplicator = Duplicator::new("split", parsed_rx, vec![left_tx, right_tx])?;
    let doubler = Doubler::default();
    let doubled = doubler.flushed.clone();
    let processor = BatchProcessor::new("double", &config, left_rx, doubler);
    let sink = SinkTask::new("archive", &config, right_rx, RecordingFlusher::<u64>::default());
    let archived = sink.flusher().clone();

    let root = Task::new("sync")
        .with_child(mapper.into_task())
        .with_child(duplicator.into_task())
        .with_child(processor.into_task())
        .with_child(sink.into_task());
    root.start()?;

    for height in ["1", "2", "oops", "3", "4", "5"] {
        source_tx.send(height.to_string()).await?;
    }
    drop(source_tx);

    wait_until(Duration::from_secs(3), "processor and sink to see every item", || {
        doubled.items().len() == 5 && archived.items().len() == 5
    })
    .await?;

    let mut doubled = doubled.items();
    doubled.sort_unstable();
    assert_eq!(doubled, vec![2, 4, 6, 8, 10]);

    let mut archived_items = archived.items();
    archived_items.sort_unstable();
    assert_eq!(archived_items, vec![1, 2, 3, 4, 5]);

    bounded(Duration::from_secs(3), root.stop_wait(Duration::from_secs(2))).await??;
    assert!(root.children().iter().all(|child| !child.is_running()));
    Ok(())
}

#[tokio::test]
async fn fatal_stage_error_surfaces_through_the_parent() -> Result<()> {
    init_tracing();
    let failing = Task::new("validator")
        .with_subtask(|| async { Err(anyhow!("signature check failed")) });
    let root = Task::new("confirm").with_child(failing);
    root.start()?;

    let err = bounded(Duration::from_secs(2), async {
        root.children()[0].wait().await
    })
    .await?
    .unwrap_err();
    let err = anyhow::Error::from(err);
    assert!(format!("{err:#}").contains("signature check failed"));

    let err = root.stop_wait(Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err.as_label(), "task_fatal");
    Ok(())
}
