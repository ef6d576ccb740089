#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use filing_pipeline::{
    ExtractedData, ExtractionError, Extractor, FilingFeed, FilingRef, FilingStore, PipelineError, Signal,
    SignalGenerator,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::TempDir;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Store in a throwaway directory; keep the `TempDir` alive for the test.
pub async fn temp_store() -> Result<(TempDir, Arc<FilingStore>)> {
    init_tracing();
    let dir = TempDir::new()?;
    let store = FilingStore::open(dir.path().join("filings.db")).await?;
    Ok((dir, Arc::new(store)))
}

pub fn filing(accession: &str, form_type: &str) -> FilingRef {
    FilingRef {
        accession: accession.to_string(),
        company_id: "0000320193".to_string(),
        company_name: Some("Apple Inc.".to_string()),
        form_type: form_type.to_string(),
        filing_date: NaiveDate::from_ymd_opt(2024, 11, 1),
        document_urls: vec![format!(
            "https://www.sec.gov/Archives/edgar/data/320193/{}/primary.htm",
            accession.replace('-', "")
        )],
    }
}

/// Admit filings directly, bypassing the poller. Returns sequence ids in order.
pub async fn seed(store: &FilingStore, filings: &[FilingRef]) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    for filing in filings {
        match store.admit(filing, Utc::now()).await? {
            filing_pipeline::Admission::Queued(id) => ids.push(id),
            filing_pipeline::Admission::AlreadySeen => anyhow::bail!("{} was already seen", filing.accession),
        }
    }
    Ok(ids)
}

/// Feed that replays canned snapshots; `None` simulates an outage.
#[derive(Default)]
pub struct ScriptedFeed {
    latest: Mutex<VecDeque<Option<Vec<FilingRef>>>>,
    by_date: Mutex<HashMap<NaiveDate, Vec<FilingRef>>>,
    failing_dates: Mutex<HashSet<NaiveDate>>,
    pub latest_calls: AtomicUsize,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_snapshot(&self, snapshot: Vec<FilingRef>) {
        self.latest.lock().unwrap().push_back(Some(snapshot));
    }

    pub fn push_outage(&self) {
        self.latest.lock().unwrap().push_back(None);
    }

    pub fn set_day(&self, date: NaiveDate, filings: Vec<FilingRef>) {
        self.by_date.lock().unwrap().insert(date, filings);
    }

    pub fn fail_day(&self, date: NaiveDate) {
        self.failing_dates.lock().unwrap().insert(date);
    }
}

#[async_trait]
impl FilingFeed for ScriptedFeed {
    fn source_name(&self) -> String {
        "scripted".to_string()
    }

    async fn fetch_latest(&self, max_items: usize) -> filing_pipeline::Result<Vec<FilingRef>> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        match self.latest.lock().unwrap().pop_front() {
            Some(Some(mut snapshot)) => {
                snapshot.truncate(max_items);
                Ok(snapshot)
            }
            Some(None) => Err(PipelineError::TransientFetch("scripted outage".to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_for_date(&self, date: NaiveDate, _max_pages: u32) -> filing_pipeline::Result<Vec<FilingRef>> {
        if self.failing_dates.lock().unwrap().contains(&date) {
            return Err(PipelineError::TransientFetch(format!("no response for {}", date)));
        }
        Ok(self.by_date.lock().unwrap().get(&date).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    /// Fail this many times, then succeed
    FailTimes(usize),
    AlwaysFail,
    Sleep(Duration),
    Panic,
}

/// Extractor whose behaviour is scripted per accession; default is success.
pub struct ScriptedExtractor {
    form_type: String,
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedExtractor {
    pub fn new(form_type: &str) -> Self {
        Self {
            form_type: form_type.to_string(),
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with(self, accession: &str, behavior: Behavior) -> Self {
        self.behaviors.lock().unwrap().insert(accession.to_string(), behavior);
        self
    }

    pub fn calls_for(&self, accession: &str) -> usize {
        self.calls.lock().unwrap().get(accession).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    fn form_type(&self) -> String {
        self.form_type.clone()
    }

    async fn extract(&self, filing: &FilingRef) -> Result<ExtractedData, ExtractionError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(filing.accession.clone()).or_insert(0);
            *count += 1;
            *count
        };

        // copied out so a scripted panic cannot poison the lock
        let behavior = self.behaviors.lock().unwrap().get(&filing.accession).copied();
        let sleep_for = match behavior {
            None | Some(Behavior::Succeed) => None,
            Some(Behavior::FailTimes(n)) if call <= n => {
                return Err(ExtractionError::Unreachable(format!("attempt {} refused", call)));
            }
            Some(Behavior::FailTimes(_)) => None,
            Some(Behavior::AlwaysFail) => {
                return Err(ExtractionError::Malformed("no financial statements".to_string()));
            }
            Some(Behavior::Sleep(d)) => Some(d),
            Some(Behavior::Panic) => panic!("extractor blew up on {}", filing.accession),
        };
        if let Some(duration) = sleep_for {
            tokio::time::sleep(duration).await;
        }

        Ok(ExtractedData {
            accession: filing.accession.clone(),
            form_type: filing.form_type.clone(),
            company_id: self.company_id(filing),
            payload: serde_json::json!({ "call": call }),
            extracted_at: Utc::now(),
        })
    }
}

/// Emits one signal per extracted filing.
pub struct OneSignalGenerator;

#[async_trait]
impl SignalGenerator for OneSignalGenerator {
    fn generator_name(&self) -> String {
        "one-signal".to_string()
    }

    async fn generate(&self, data: &ExtractedData) -> anyhow::Result<Vec<Signal>> {
        Ok(vec![Signal::new(data, "filing_event", 0.5, format!("new {}", data.form_type))])
    }
}

pub struct FailingGenerator;

#[async_trait]
impl SignalGenerator for FailingGenerator {
    fn generator_name(&self) -> String {
        "failing".to_string()
    }

    async fn generate(&self, _data: &ExtractedData) -> anyhow::Result<Vec<Signal>> {
        anyhow::bail!("reference data unavailable")
    }
}
