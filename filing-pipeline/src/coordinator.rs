use crate::edgar_utils;
use crate::registry::ExtractorRegistry;
use crate::signals::SignalHistory;
use crate::store::FilingStore;
use crate::types::{
    BatchReport, CoordinatorConfig, ExtractedData, ExtractionError, Extractor, PipelineError, QueueItem, Result,
    Signal, SignalGenerator,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Done { signals: usize },
    Retried,
    Failed,
}

/// Drains the dispatch queue: extractor, then signal generator, then a
/// terminal or retry status per item.
///
/// Safe to share between several workers; the store's claim keeps them apart.
pub struct ProcessingCoordinator {
    store: Arc<FilingStore>,
    registry: Arc<ExtractorRegistry>,
    generator: Arc<dyn SignalGenerator>,
    history: SignalHistory,
    config: CoordinatorConfig,
}

impl ProcessingCoordinator {
    pub fn new(
        store: Arc<FilingStore>,
        registry: Arc<ExtractorRegistry>,
        generator: Arc<dyn SignalGenerator>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            generator,
            history: SignalHistory::new(),
            config,
        }
    }

    pub fn history(&self) -> &SignalHistory {
        &self.history
    }

    /// Startup reconciliation. Call once, before any worker starts.
    ///
    /// Only claims of other processes older than `claim_lease` are requeued,
    /// so this is safe while another process is working the same store.
    pub async fn recover(&self) -> Result<u64> {
        self.store.recover_in_progress(self.config.claim_lease).await
    }

    /// Claim one batch and settle every item in it.
    ///
    /// Per-item problems end up as item status; only store failures are
    /// returned, and any items still claimed at that point are left for
    /// startup recovery.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let items = self.store.dequeue_batch(self.config.batch_size.max(1)).await?;
        let mut report = BatchReport {
            claimed: items.len(),
            ..Default::default()
        };

        for item in &items {
            match self.process_item(item).await {
                Ok(ItemOutcome::Done { signals }) => {
                    report.done += 1;
                    report.signals += signals;
                }
                Ok(ItemOutcome::Retried) => report.retried += 1,
                Ok(ItemOutcome::Failed) => report.failed += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Queue item #{} left unsettled: {}", item.sequence_id, e),
            }
        }

        if report.claimed > 0 {
            debug!("Batch settled: {:?}", report);
        }
        Ok(report)
    }

    async fn process_item(&self, item: &QueueItem) -> Result<ItemOutcome> {
        let sequence_id = item.sequence_id;
        let filing = &item.filing;

        // later items of a batch wait their turn; confirm the claim still holds
        self.store.renew_claim(sequence_id).await?;

        let extractor = match self.registry.resolve(&filing.form_type) {
            Ok(extractor) => extractor,
            Err(e) => {
                warn!("#{} {}: {}", sequence_id, filing.accession, e);
                self.store.mark_failed(sequence_id, &e.to_string()).await?;
                return Ok(ItemOutcome::Failed);
            }
        };

        let data = match self.extract(extractor, item).await {
            Ok(data) => data,
            Err(e) => return self.settle_failure(item, &e).await,
        };

        let signals = match self.generate(data).await {
            Ok(signals) => signals,
            Err(e) => return self.settle_failure(item, &e).await,
        };

        // persisted before the done mark: a crash in between replays the item
        self.store.record_signals(sequence_id, &signals).await?;
        self.history.append(&signals).await;
        self.store.mark_done(sequence_id).await?;

        info!(
            "Processed #{} {} {} ({} signals)",
            sequence_id,
            filing.accession,
            filing.form_type,
            signals.len()
        );
        Ok(ItemOutcome::Done { signals: signals.len() })
    }

    // Runs on its own task so a hung or panicking extractor only costs its item.
    async fn extract(&self, extractor: Arc<dyn Extractor>, item: &QueueItem) -> Result<ExtractedData> {
        let limit = self.config.extraction_timeout;
        let filing = item.filing.clone();
        let mut handle = tokio::spawn(async move { extractor.extract(&filing).await });

        let outcome = match timeout(limit, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ExtractionError::Aborted(join_error.to_string())),
            Err(_) => {
                handle.abort();
                Err(ExtractionError::TimedOut(limit))
            }
        };
        Ok(outcome?)
    }

    async fn generate(&self, data: ExtractedData) -> Result<Vec<Signal>> {
        let limit = self.config.extraction_timeout;
        let generator = self.generator.clone();
        let mut handle = tokio::spawn(async move { generator.generate(&data).await });

        match timeout(limit, &mut handle).await {
            Ok(Ok(Ok(signals))) => Ok(signals),
            Ok(Ok(Err(e))) => Err(PipelineError::SignalGeneration(e.to_string())),
            Ok(Err(join_error)) => Err(PipelineError::SignalGeneration(format!("generator aborted: {}", join_error))),
            Err(_) => {
                handle.abort();
                Err(PipelineError::SignalGeneration(format!("timed out after {:?}", limit)))
            }
        }
    }

    async fn settle_failure(&self, item: &QueueItem, cause: &PipelineError) -> Result<ItemOutcome> {
        let sequence_id = item.sequence_id;
        let reason = cause.to_string();
        let attempts = self.store.record_failed_attempt(sequence_id, &reason).await?;
        let budget = self.config.retry_budget.max(1);

        if attempts < budget {
            warn!(
                "#{} {} attempt {}/{} failed, retry in {}: {}",
                sequence_id,
                item.filing.accession,
                attempts,
                budget,
                edgar_utils::time::format_duration(self.config.retry_delay),
                reason
            );
            self.store.requeue_after(sequence_id, self.config.retry_delay).await?;
            Ok(ItemOutcome::Retried)
        } else {
            warn!(
                "#{} {} failed after {} attempts: {}",
                sequence_id, item.filing.accession, attempts, reason
            );
            self.store.mark_failed(sequence_id, &reason).await?;
            Ok(ItemOutcome::Failed)
        }
    }

    /// Process batches until a claim comes back empty.
    ///
    /// Items waiting out their retry delay are not claimable yet and stay pending.
    pub async fn process_until_idle(&self) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        loop {
            let report = self.process_batch().await?;
            if report.claimed == 0 {
                break;
            }
            total.absorb(&report);
        }
        Ok(total)
    }

    /// Worker loop: drain while there is work, otherwise wait `idle_interval`
    /// or until `shutdown` flips to true.
    pub async fn run(&self, worker: usize, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Coordinator worker {} started", worker);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = match self.process_batch().await {
                Ok(report) => report,
                Err(e) => {
                    error!("Coordinator worker {} halting: {}", worker, e);
                    return Err(e);
                }
            };

            if report.claimed > 0 {
                info!(
                    "Worker {}: {} claimed, {} done, {} retried, {} failed, {} signals",
                    worker, report.claimed, report.done, report.retried, report.failed, report.signals
                );
                continue;
            }

            tokio::select! {
                _ = sleep(self.config.idle_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Coordinator worker {} stopped", worker);
        Ok(())
    }
}
