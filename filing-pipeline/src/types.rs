use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
// Use the interfaces crate for the shared data model
pub use interfaces::defs::{ExtractedData, ExtractionError, Extractor, FilingRef, Signal, SignalGenerator};

pub const DEFAULT_SEARCH_URL: &str = "https://efts.sec.gov/LATEST/search-index";
pub const DEFAULT_USER_AGENT: &str = "sec-poller/1.0 (you@example.com)";
pub const ARCHIVES_BASE_URL: &str = "https://www.sec.gov/Archives/edgar/data";
pub const DEFAULT_SUPPORTED_FORMS: &[&str] = &["10-K", "10-Q", "8-K", "4", "13F-HR"];

/// The search index serves at most this many hits per page.
pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Done | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "in_progress" => Ok(QueueStatus::InProgress),
            "done" => Ok(QueueStatus::Done),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(PipelineError::General(format!("unknown queue status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub sequence_id: i64,
    pub filing: FilingRef,
    pub enqueued_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub accession: String,
    pub first_seen_at: DateTime<Utc>,
}

/// Outcome of admitting a feed entry into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued(i64),
    AlreadySeen,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub in_progress: i64,
    pub done: i64,
    pub failed: i64,
    pub seen: i64,
    pub signals: i64,
    pub top_forms: Vec<(String, i64)>,
}

impl QueueStats {
    pub fn queued(&self) -> i64 {
        self.pending + self.in_progress + self.done + self.failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilingSummaryRow {
    pub company_id: String,
    pub form_type: String,
    pub filing_count: i64,
    pub latest_filing: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default)]
pub struct FilingQuery {
    pub company_id: Option<String>,
    pub form_type: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub search_url: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_millis: u64,
    pub page_delay_millis: u64,
    pub max_pages: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_seconds: 10,
            max_retries: 2,
            retry_delay_millis: 500,
            page_delay_millis: 100,
            max_pages: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub max_filings_per_poll: usize,
    /// Page limit per day when backfilling history
    pub backfill_max_pages: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_filings_per_poll: 100,
            backfill_max_pages: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub batch_size: usize,
    /// Total extraction attempts per item before it is marked failed
    pub retry_budget: u32,
    /// Bounds extraction and signal generation separately
    pub extraction_timeout: Duration,
    pub idle_interval: Duration,
    /// Wait before a failed attempt may be claimed again
    pub retry_delay: Duration,
    /// How long another process's claim must sit untouched before startup
    /// recovery treats it as abandoned. Keep it above twice `extraction_timeout`.
    pub claim_lease: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            retry_budget: 3,
            extraction_timeout: Duration::from_secs(30),
            idle_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(60),
            claim_lease: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
    pub fetched: usize,
    pub duplicates_in_cycle: usize,
    pub already_seen: usize,
    pub enqueued: usize,
    pub fetch_failed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillReport {
    pub days: Vec<(NaiveDate, PollReport)>,
}

impl BackfillReport {
    pub fn total_enqueued(&self) -> usize {
        self.days.iter().map(|(_, report)| report.enqueued).sum()
    }

    pub fn failed_days(&self) -> usize {
        self.days.iter().filter(|(_, report)| report.fetch_failed).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub done: usize,
    pub retried: usize,
    pub failed: usize,
    pub signals: usize,
}

impl BatchReport {
    pub fn absorb(&mut self, other: &BatchReport) {
        self.claimed += other.claimed;
        self.done += other.done;
        self.retried += other.retried;
        self.failed += other.failed;
        self.signals += other.signals;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Feed unavailable: {0}")]
    TransientFetch(String),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Accession {accession} already present")]
    DuplicateKey { accession: String },

    #[error("Unsupported form type: {form_type}")]
    UnsupportedFormType { form_type: String },

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Signal generation failed: {0}")]
    SignalGeneration(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("Store migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Queue item {sequence_id} is not in progress")]
    NotClaimed { sequence_id: i64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("General error: {0}")]
    General(String),
}

impl PipelineError {
    /// Store-level failures halt the loops; everything else is absorbed per cycle or per item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::StoreUnavailable(_) | PipelineError::Migration(_))
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::TransientFetch(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
