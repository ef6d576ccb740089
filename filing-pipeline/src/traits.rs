use crate::types::{FilingRef, Result};
use async_trait::async_trait;
use chrono::NaiveDate;

/// A source of filing announcements (the EDGAR search index, or a scripted
/// feed in tests).
#[async_trait]
pub trait FilingFeed: Send + Sync {
    /// Human-readable name for this source
    fn source_name(&self) -> String;

    /// Most recent filings in feed order, at most `max_items` of them.
    async fn fetch_latest(&self, max_items: usize) -> Result<Vec<FilingRef>>;

    /// Every filing for one calendar day, reading at most `max_pages` pages.
    async fn fetch_for_date(&self, date: NaiveDate, max_pages: u32) -> Result<Vec<FilingRef>>;
}
