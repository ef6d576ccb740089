mod common;

use anyhow::Result;
use common::{filing, seed, temp_store, Behavior, FailingGenerator, OneSignalGenerator, ScriptedExtractor};
use filing_pipeline::{
    CoordinatorConfig, Extractor, ExtractorRegistry, FilingStore, ProcessingCoordinator, QueueStatus, SignalGenerator,
};
use interfaces::{BaselineExtractor, EmptySignalGenerator};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

fn registry(extractors: Vec<Arc<ScriptedExtractor>>) -> Arc<ExtractorRegistry> {
    let mut registry = ExtractorRegistry::new();
    for extractor in extractors {
        registry.register(extractor.form_type(), extractor);
    }
    Arc::new(registry)
}

fn coordinator(
    store: Arc<FilingStore>,
    registry: Arc<ExtractorRegistry>,
    generator: Arc<dyn SignalGenerator>,
    retry_budget: u32,
) -> ProcessingCoordinator {
    ProcessingCoordinator::new(
        store,
        registry,
        generator,
        CoordinatorConfig {
            batch_size: 10,
            retry_budget,
            extraction_timeout: Duration::from_secs(2),
            idle_interval: Duration::from_millis(10),
            retry_delay: Duration::ZERO,
            claim_lease: Duration::ZERO,
        },
    )
}

#[tokio::test]
async fn test_unsupported_form_type_fails_item_and_continues() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let ids = seed(&store, &[filing("A1", "10-K"), filing("A2", "4"), filing("A3", "8-K")]).await?;

    let mut registry = ExtractorRegistry::new();
    registry.register("10-K", Arc::new(BaselineExtractor::new("10-K")));
    registry.register("8-K", Arc::new(BaselineExtractor::new("8-K")));
    let coordinator = coordinator(store.clone(), Arc::new(registry), Arc::new(EmptySignalGenerator), 3);

    let report = coordinator.process_batch().await?;
    info!("Batch: {:?}", report);
    assert_eq!(report.claimed, 3);
    assert_eq!(report.done, 2);
    assert_eq!(report.failed, 1);

    let unsupported = store.queue_item(ids[1]).await?.expect("queue row");
    assert_eq!(unsupported.status, QueueStatus::Failed);
    assert_eq!(unsupported.attempts, 0);
    assert!(unsupported.last_error.unwrap_or_default().contains("Unsupported form type: 4"));

    assert_eq!(store.queue_item(ids[2]).await?.expect("queue row").status, QueueStatus::Done);
    Ok(())
}

#[tokio::test]
async fn test_failing_item_does_not_block_batch() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let ids = seed(&store, &[filing("A1", "8-K"), filing("A2", "8-K"), filing("A3", "8-K")]).await?;

    let extractor = Arc::new(ScriptedExtractor::new("8-K").with("A2", Behavior::AlwaysFail));
    let coordinator = coordinator(store.clone(), registry(vec![extractor]), Arc::new(EmptySignalGenerator), 3);

    let report = coordinator.process_batch().await?;
    assert_eq!(report.done, 2);
    assert_eq!(report.retried, 1);

    let failing = store.queue_item(ids[1]).await?.expect("queue row");
    assert_eq!(failing.status, QueueStatus::Pending);
    assert_eq!(failing.attempts, 1);
    assert_eq!(store.queue_item(ids[0]).await?.expect("queue row").status, QueueStatus::Done);
    assert_eq!(store.queue_item(ids[2]).await?.expect("queue row").status, QueueStatus::Done);
    Ok(())
}

#[tokio::test]
async fn test_retry_budget_is_exhausted_then_failed() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let ids = seed(&store, &[filing("A1", "8-K"), filing("A2", "8-K")]).await?;

    let extractor = Arc::new(ScriptedExtractor::new("8-K").with("A2", Behavior::AlwaysFail));
    let coordinator = coordinator(
        store.clone(),
        registry(vec![extractor.clone()]),
        Arc::new(EmptySignalGenerator),
        3,
    );

    let total = coordinator.process_until_idle().await?;
    info!("Drained: {:?}", total);

    let failed = store.queue_item(ids[1]).await?.expect("queue row");
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert_eq!(extractor.calls_for("A2"), 3);
    assert_eq!(extractor.calls_for("A1"), 1);
    assert_eq!(total.done, 1);
    assert_eq!(total.retried, 2);
    assert_eq!(total.failed, 1);

    // nothing left to claim
    assert!(store.dequeue_batch(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_transient_extraction_failure_recovers() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let ids = seed(&store, &[filing("A1", "10-Q")]).await?;

    let extractor = Arc::new(ScriptedExtractor::new("10-Q").with("A1", Behavior::FailTimes(2)));
    let coordinator = coordinator(
        store.clone(),
        registry(vec![extractor.clone()]),
        Arc::new(OneSignalGenerator),
        3,
    );

    let total = coordinator.process_until_idle().await?;
    assert_eq!(total.done, 1);
    assert_eq!(total.signals, 1);

    let item = store.queue_item(ids[0]).await?.expect("queue row");
    assert_eq!(item.status, QueueStatus::Done);
    assert_eq!(item.attempts, 2);
    assert_eq!(item.last_error, None);
    assert_eq!(extractor.calls_for("A1"), 3);
    Ok(())
}

#[tokio::test]
async fn test_slow_extraction_times_out() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let ids = seed(&store, &[filing("A1", "10-K"), filing("A2", "10-K")]).await?;

    let extractor = Arc::new(ScriptedExtractor::new("10-K").with("A1", Behavior::Sleep(Duration::from_secs(30))));
    let coordinator = ProcessingCoordinator::new(
        store.clone(),
        registry(vec![extractor]),
        Arc::new(EmptySignalGenerator),
        CoordinatorConfig {
            retry_budget: 1,
            extraction_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let report = tokio::time::timeout(Duration::from_secs(5), coordinator.process_batch()).await??;
    assert_eq!(report.failed, 1);
    assert_eq!(report.done, 1);

    let slow = store.queue_item(ids[0]).await?.expect("queue row");
    assert_eq!(slow.status, QueueStatus::Failed);
    assert!(slow.last_error.unwrap_or_default().contains("timed out"));
    Ok(())
}

#[tokio::test]
async fn test_panicking_extractor_is_contained() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let ids = seed(&store, &[filing("A1", "8-K"), filing("A2", "8-K")]).await?;

    let extractor = Arc::new(ScriptedExtractor::new("8-K").with("A1", Behavior::Panic));
    let coordinator = coordinator(store.clone(), registry(vec![extractor]), Arc::new(EmptySignalGenerator), 1);

    let report = coordinator.process_batch().await?;
    assert_eq!(report.failed, 1);
    assert_eq!(report.done, 1);
    assert_eq!(store.queue_item(ids[0]).await?.expect("queue row").status, QueueStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_generator_failure_counts_as_attempt() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let ids = seed(&store, &[filing("A1", "8-K")]).await?;

    let extractor = Arc::new(ScriptedExtractor::new("8-K"));
    let coordinator = coordinator(store.clone(), registry(vec![extractor]), Arc::new(FailingGenerator), 2);

    coordinator.process_until_idle().await?;

    let item = store.queue_item(ids[0]).await?.expect("queue row");
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.attempts, 2);
    assert!(item.last_error.unwrap_or_default().contains("reference data unavailable"));
    assert_eq!(store.queue_stats().await?.signals, 0);
    assert!(coordinator.history().is_empty().await);
    Ok(())
}

#[tokio::test]
async fn test_signals_are_recorded_in_store_and_history() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    seed(&store, &[filing("A1", "10-K"), filing("A2", "8-K")]).await?;

    let mut registry = ExtractorRegistry::new();
    registry.register("10-K", Arc::new(BaselineExtractor::new("10-K")));
    registry.register("8-K", Arc::new(BaselineExtractor::new("8-K")));
    let coordinator = coordinator(store.clone(), Arc::new(registry), Arc::new(OneSignalGenerator), 3);

    let report = coordinator.process_until_idle().await?;
    assert_eq!(report.signals, 2);
    assert_eq!(coordinator.history().len().await, 2);
    assert_eq!(coordinator.history().for_company("0000320193").await.len(), 2);

    let stored = store.recent_signals(10).await?;
    assert_eq!(stored.len(), 2);
    let accessions: HashSet<_> = stored.iter().map(|s| s.accession.as_str()).collect();
    assert!(accessions.contains("A1") && accessions.contains("A2"));
    assert!(stored.iter().all(|s| s.signal_type == "filing_event"));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_claims_never_overlap() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let filings: Vec<_> = (0..120).map(|i| filing(&format!("C{:03}", i), "8-K")).collect();
    seed(&store, &filings).await?;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = store.dequeue_batch(7).await?;
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|item| item.sequence_id));
            }
            Ok::<_, filing_pipeline::PipelineError>(claimed)
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await??);
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 120);
    assert_eq!(unique.len(), 120);
    assert_eq!(store.queue_stats().await?.in_progress, 120);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_workers_process_each_item_once() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let filings: Vec<_> = (0..60).map(|i| filing(&format!("W{:03}", i), "10-K")).collect();
    seed(&store, &filings).await?;

    let extractor = Arc::new(ScriptedExtractor::new("10-K"));
    let coordinator = Arc::new(coordinator(
        store.clone(),
        registry(vec![extractor.clone()]),
        Arc::new(OneSignalGenerator),
        3,
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move { coordinator.process_until_idle().await }));
    }
    let mut done = 0;
    for handle in handles {
        done += handle.await??.done;
    }

    assert_eq!(done, 60);
    assert_eq!(extractor.total_calls(), 60);
    let stats = store.queue_stats().await?;
    assert_eq!(stats.done, 60);
    assert_eq!(stats.signals, 60);
    Ok(())
}

#[tokio::test]
async fn test_abandoned_claims_are_recovered_after_restart() -> Result<()> {
    common::init_tracing();
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("filings.db");

    {
        let store = FilingStore::open(&path).await?;
        seed(&store, &[filing("A1", "8-K"), filing("A2", "8-K"), filing("A3", "8-K")]).await?;
        // claimed, then the process dies before settling
        let claimed = store.dequeue_batch(2).await?;
        assert_eq!(claimed.len(), 2);
        store.close().await;
    }

    let store = Arc::new(FilingStore::open(&path).await?);
    let stats = store.queue_stats().await?;
    assert_eq!(stats.in_progress, 2);
    assert_eq!(stats.pending, 1);

    let extractor = Arc::new(ScriptedExtractor::new("8-K"));
    let coordinator = coordinator(store.clone(), registry(vec![extractor]), Arc::new(EmptySignalGenerator), 3);
    assert_eq!(coordinator.recover().await?, 2);

    let total = coordinator.process_until_idle().await?;
    assert_eq!(total.done, 3);

    for item in store.queue_items_with_status(QueueStatus::Done).await? {
        assert_eq!(item.attempts, 0);
    }
    assert_eq!(store.queue_stats().await?.done, 3);
    Ok(())
}

#[tokio::test]
async fn test_second_process_does_not_take_running_claims() -> Result<()> {
    common::init_tracing();
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("filings.db");

    let running = FilingStore::open(&path).await?;
    let ids = seed(&running, &[filing("A1", "8-K"), filing("A2", "8-K")]).await?;
    // the long-running worker is in the middle of A1
    let held = running.dequeue_batch(1).await?;
    assert_eq!(held[0].sequence_id, ids[0]);

    // `process` started by hand against the same database
    let other = Arc::new(FilingStore::open(&path).await?);
    let extractor = Arc::new(ScriptedExtractor::new("8-K"));
    let coordinator = ProcessingCoordinator::new(
        other.clone(),
        registry(vec![extractor.clone()]),
        Arc::new(EmptySignalGenerator),
        CoordinatorConfig::default(),
    );

    assert_eq!(coordinator.recover().await?, 0);
    let total = coordinator.process_until_idle().await?;
    assert_eq!(total.claimed, 1);
    assert_eq!(extractor.calls_for("A1"), 0);
    assert_eq!(extractor.calls_for("A2"), 1);

    // the original holder still settles its own item
    running.mark_done(ids[0]).await?;
    assert_eq!(other.queue_stats().await?.done, 2);
    Ok(())
}

#[tokio::test]
async fn test_failed_attempt_waits_for_retry_delay() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    let ids = seed(&store, &[filing("A1", "8-K")]).await?;

    let extractor = Arc::new(ScriptedExtractor::new("8-K").with("A1", Behavior::FailTimes(1)));
    let coordinator = ProcessingCoordinator::new(
        store.clone(),
        registry(vec![extractor.clone()]),
        Arc::new(EmptySignalGenerator),
        CoordinatorConfig {
            retry_delay: Duration::from_secs(3600),
            ..Default::default()
        },
    );

    let total = coordinator.process_until_idle().await?;
    assert_eq!(total.claimed, 1);
    assert_eq!(total.retried, 1);
    assert_eq!(extractor.calls_for("A1"), 1);

    let item = store.queue_item(ids[0]).await?.expect("queue row");
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.attempts, 1);
    assert!(item.last_error.unwrap_or_default().contains("Extraction failed: document unreachable"));

    // still parked on the next pass
    assert_eq!(coordinator.process_batch().await?.claimed, 0);
    Ok(())
}

#[tokio::test]
async fn test_worker_loop_drains_and_stops() -> Result<()> {
    let (_dir, store) = temp_store().await?;
    seed(&store, &[filing("A1", "8-K"), filing("A2", "8-K")]).await?;

    let extractor = Arc::new(ScriptedExtractor::new("8-K"));
    let coordinator = Arc::new(coordinator(
        store.clone(),
        registry(vec![extractor]),
        Arc::new(EmptySignalGenerator),
        3,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(0, shutdown_rx).await })
    };

    // work admitted while the worker is idling is picked up too
    tokio::time::sleep(Duration::from_millis(30)).await;
    seed(&store, &[filing("A3", "8-K")]).await?;

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.queue_stats().await.map(|s| s.done).unwrap_or(0) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    shutdown_tx.send(true)?;
    tokio::time::timeout(Duration::from_secs(5), handle).await???;
    Ok(())
}
