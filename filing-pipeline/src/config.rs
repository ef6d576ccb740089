use crate::edgar_utils;
use crate::types::{
    CoordinatorConfig, FetchConfig, FilingQuery, PipelineError, PollerConfig, Result, DEFAULT_SEARCH_URL,
    DEFAULT_USER_AGENT,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "filing-pipeline", version, about = "Collect, dedup and process SEC EDGAR filings")]
pub struct Cli {
    /// SQLite database holding the seen set, queue and signals
    #[arg(long, env = "FILINGS_DB", default_value = "filings.db", global = true)]
    pub database: PathBuf,

    /// Full-text search index endpoint
    #[arg(long, env = "SEC_SEARCH_URL", default_value = DEFAULT_SEARCH_URL, global = true)]
    pub endpoint: String,

    /// Identifying User-Agent sent with every request, with a contact address
    #[arg(long, env = "SEC_USER_AGENT", default_value = DEFAULT_USER_AGENT, global = true)]
    pub user_agent: String,

    #[arg(long, default_value_t = 60, global = true)]
    pub poll_interval_secs: u64,

    #[arg(long, default_value_t = 10, global = true)]
    pub fetch_timeout_secs: u64,

    /// HTTP retries per request within one cycle
    #[arg(long, default_value_t = 2, global = true)]
    pub max_retries: u32,

    /// Form types to register extractors for
    #[arg(long, value_delimiter = ',', default_value = "10-K,10-Q,8-K,4,13F-HR", global = true)]
    pub forms: Vec<String>,

    /// Total extraction attempts per queue item
    #[arg(long, default_value_t = 3, global = true)]
    pub retry_budget: u32,

    #[arg(long, default_value_t = 25, global = true)]
    pub batch_size: usize,

    /// Coordinator workers for `run`
    #[arg(long, default_value_t = 1, global = true)]
    pub workers: usize,

    #[arg(long, default_value_t = 30, global = true)]
    pub extraction_timeout_secs: u64,

    /// Wait before a failed item is tried again
    #[arg(long, default_value_t = 60, global = true)]
    pub retry_delay_secs: u64,

    /// Age after which another process's in-progress claim counts as abandoned
    #[arg(long, default_value_t = 600, global = true)]
    pub claim_lease_secs: u64,

    #[arg(long, default_value_t = 100, global = true)]
    pub max_filings_per_poll: usize,

    /// Search result pages read per live poll
    #[arg(long, default_value_t = 5, global = true)]
    pub max_pages: u32,

    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll and process continuously until Ctrl-C
    Run,
    /// Run a single poll cycle
    Poll,
    /// Drain the queue once and print generated signals
    Process,
    /// Collect historical filings for past business days
    Backfill {
        #[arg(long, default_value_t = 365)]
        days: u32,
    },
    /// Filings per company and form type over recent days
    Summary {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Search queued filings
    Search {
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        form: Option<String>,
        /// Earliest filing date, YYYY-MM-DD
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,
        /// Latest filing date, YYYY-MM-DD
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,
    },
    /// Queue and store counters
    Stats,
    /// Most recent stored signals
    Signals {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn parse_date(raw: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

impl Cli {
    pub fn validate(&self) -> Result<()> {
        if !edgar_utils::url::is_http_url(&self.endpoint) {
            return Err(PipelineError::Config(format!("endpoint is not an http(s) URL: {}", self.endpoint)));
        }
        if self.supported_forms().is_empty() {
            return Err(PipelineError::Config("at least one form type is required".to_string()));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("--workers must be at least 1".to_string()));
        }
        if self.retry_budget == 0 {
            return Err(PipelineError::Config("--retry-budget must be at least 1".to_string()));
        }
        // extraction and signal generation each get the full timeout
        if self.claim_lease_secs <= self.extraction_timeout_secs.saturating_mul(2) {
            return Err(PipelineError::Config(format!(
                "--claim-lease-secs ({}) must exceed twice --extraction-timeout-secs ({})",
                self.claim_lease_secs, self.extraction_timeout_secs
            )));
        }
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level> {
        self.log_level
            .parse::<Level>()
            .map_err(|_| PipelineError::Config(format!("unknown log level: {}", self.log_level)))
    }

    /// Trimmed, de-duplicated form types in the order given
    pub fn supported_forms(&self) -> Vec<String> {
        let mut forms: Vec<String> = Vec::new();
        for form in &self.forms {
            let form = form.trim();
            if !form.is_empty() && !forms.iter().any(|f| f == form) {
                forms.push(form.to_string());
            }
        }
        forms
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            search_url: self.endpoint.clone(),
            user_agent: self.user_agent.clone(),
            timeout_seconds: self.fetch_timeout_secs,
            max_retries: self.max_retries,
            max_pages: self.max_pages,
            ..Default::default()
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            max_filings_per_poll: self.max_filings_per_poll,
            ..Default::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            batch_size: self.batch_size,
            retry_budget: self.retry_budget,
            extraction_timeout: Duration::from_secs(self.extraction_timeout_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            claim_lease: Duration::from_secs(self.claim_lease_secs),
            ..Default::default()
        }
    }
}

impl Command {
    /// Query for the `search` subcommand, if that is what was asked for
    pub fn filing_query(&self) -> Option<FilingQuery> {
        match self {
            Command::Search { company, form, from, to } => Some(FilingQuery {
                company_id: company.clone(),
                form_type: form.clone(),
                date_from: *from,
                date_to: *to,
                limit: 100,
            }),
            _ => None,
        }
    }
}
