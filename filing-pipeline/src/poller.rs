use crate::edgar_utils;
use crate::store::FilingStore;
use crate::traits::FilingFeed;
use crate::types::{Admission, BackfillReport, FilingRef, PollReport, PollerConfig, Result};
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

// tokio's interval panics on a zero period
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Fetching,
    Filtering,
    Enqueuing,
}

/// Fetches the feed on an interval and admits unseen filings into the store.
pub struct FeedPoller {
    feed: Arc<dyn FilingFeed>,
    store: Arc<FilingStore>,
    config: PollerConfig,
    state: Arc<RwLock<PollerState>>,
}

impl FeedPoller {
    /// A zero `poll_interval` is raised to one millisecond.
    pub fn new(feed: Arc<dyn FilingFeed>, store: Arc<FilingStore>, mut config: PollerConfig) -> Self {
        config.poll_interval = config.poll_interval.max(MIN_POLL_INTERVAL);
        Self {
            feed,
            store,
            config,
            state: Arc::new(RwLock::new(PollerState::Idle)),
        }
    }

    pub async fn state(&self) -> PollerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: PollerState) {
        *self.state.write().await = state;
    }

    /// Run a single cycle.
    ///
    /// A feed failure is logged and reported with `fetch_failed`; only
    /// store errors come back as `Err`.
    pub async fn poll_once(&self) -> Result<PollReport> {
        self.set_state(PollerState::Fetching).await;

        let entries = match self.feed.fetch_latest(self.config.max_filings_per_poll).await {
            Ok(entries) => entries,
            Err(e) if e.is_fatal() => {
                self.set_state(PollerState::Idle).await;
                return Err(e);
            }
            Err(e) => {
                warn!("Skipping poll cycle, {} failed: {}", self.feed.source_name(), e);
                self.set_state(PollerState::Idle).await;
                return Ok(PollReport {
                    fetch_failed: true,
                    ..Default::default()
                });
            }
        };

        let result = self.admit_entries(entries).await;
        self.set_state(PollerState::Idle).await;
        result
    }

    async fn admit_entries(&self, entries: Vec<FilingRef>) -> Result<PollReport> {
        let mut report = PollReport {
            fetched: entries.len(),
            ..Default::default()
        };

        self.set_state(PollerState::Filtering).await;
        let mut working_set = HashSet::with_capacity(entries.len());
        let mut fresh = Vec::new();

        for filing in entries {
            if !working_set.insert(filing.accession.clone()) {
                debug!("Dropping repeat of {} within this snapshot", filing.accession);
                report.duplicates_in_cycle += 1;
                continue;
            }
            if self.store.has_seen(&filing.accession).await? {
                report.already_seen += 1;
                continue;
            }
            fresh.push(filing);
        }

        self.set_state(PollerState::Enqueuing).await;
        for filing in fresh {
            match self.store.admit(&filing, Utc::now()).await? {
                Admission::Queued(sequence_id) => {
                    report.enqueued += 1;
                    info!(
                        "Queued {} {} {} as #{}",
                        filing.accession,
                        filing.form_type,
                        filing.company_name.as_deref().unwrap_or(&filing.company_id),
                        sequence_id
                    );
                }
                Admission::AlreadySeen => report.already_seen += 1,
            }
        }

        Ok(report)
    }

    /// Poll every `poll_interval` until `shutdown` flips to true.
    ///
    /// The first cycle runs immediately. Returns `Err` only when the store
    /// fails, at which point the loop has stopped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Poller started for {} every {}",
            self.feed.source_name(),
            edgar_utils::time::format_duration(self.config.poll_interval)
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(report) if report.fetch_failed => {}
                        Ok(report) => info!(
                            "Poll cycle: {} fetched, {} new, {} already seen, {} repeated",
                            report.fetched, report.enqueued, report.already_seen, report.duplicates_in_cycle
                        ),
                        Err(e) => {
                            error!("Poller halting: {}", e);
                            return Err(e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Poller stopped");
        Ok(())
    }

    /// Collect every business day in the `days` before `today`, oldest first,
    /// through the same admission path as live polling.
    pub async fn backfill(&self, today: NaiveDate, days: u32) -> Result<BackfillReport> {
        let dates = edgar_utils::time::business_days(today, days);
        info!("Backfilling {} business days", dates.len());

        let mut backfill = BackfillReport::default();
        for date in dates {
            self.set_state(PollerState::Fetching).await;
            let entries = match self.feed.fetch_for_date(date, self.config.backfill_max_pages).await {
                Ok(entries) => entries,
                Err(e) if e.is_fatal() => {
                    self.set_state(PollerState::Idle).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!("Skipping {}: {}", date, e);
                    backfill.days.push((
                        date,
                        PollReport {
                            fetch_failed: true,
                            ..Default::default()
                        },
                    ));
                    continue;
                }
            };

            let report = self.admit_entries(entries).await;
            self.set_state(PollerState::Idle).await;
            let report = report?;

            info!("{}: {} new, {} already seen", date, report.enqueued, report.already_seen);
            backfill.days.push((date, report));
        }

        self.set_state(PollerState::Idle).await;
        Ok(backfill)
    }
}
