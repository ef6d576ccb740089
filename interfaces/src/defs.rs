use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A filing as announced by the source feed.
///
/// The accession identifier is the identity: two values with the same
/// `accession` are the same filing even if the other fields differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilingRef {
    pub accession: String,
    pub company_id: String,
    pub company_name: Option<String>,
    pub form_type: String,
    pub filing_date: Option<NaiveDate>,
    pub document_urls: Vec<String>,
}

impl FilingRef {
    pub fn primary_document(&self) -> Option<&str> {
        self.document_urls.first().map(String::as_str)
    }
}

impl PartialEq for FilingRef {
    fn eq(&self, other: &Self) -> bool {
        self.accession == other.accession
    }
}

impl Eq for FilingRef {}

/// Structured output of an extractor, keyed by (accession, form type).
/// The pipeline never looks inside `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedData {
    pub accession: String,
    pub form_type: String,
    pub company_id: String,
    pub payload: serde_json::Value,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub accession: String,
    pub company_id: String,
    pub signal_type: String,
    pub strength: f64,
    pub reasoning: String,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(data: &ExtractedData, signal_type: impl Into<String>, strength: f64, reasoning: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            accession: data.accession.clone(),
            company_id: data.company_id.clone(),
            signal_type: signal_type.into(),
            strength,
            reasoning: reasoning.into(),
            generated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractionError {
    #[error("malformed filing: {0}")]
    Malformed(String),

    #[error("document unreachable: {0}")]
    Unreachable(String),

    #[error("extraction timed out after {0:?}")]
    TimedOut(Duration),

    #[error("extractor aborted: {0}")]
    Aborted(String),
}

// Object style note:
// Extractors and signal generators are registered once at startup and
// shared between coordinator workers, so they take `&self` and keep no
// per-filing state. Anything they need per filing is passed in.

/// Turns one filing of a given form type into structured data.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// The form-type tag this extractor handles, e.g. "10-K"
    fn form_type(&self) -> String;

    fn company_id(&self, filing: &FilingRef) -> String {
        filing.company_id.clone()
    }

    async fn extract(&self, filing: &FilingRef) -> Result<ExtractedData, ExtractionError>;
}

/// Derives zero or more signals from extracted data.
///
/// Must not touch pipeline state; an empty result is a normal outcome.
#[async_trait]
pub trait SignalGenerator: Send + Sync {
    fn generator_name(&self) -> String;

    async fn generate(&self, data: &ExtractedData) -> anyhow::Result<Vec<Signal>>;
}
