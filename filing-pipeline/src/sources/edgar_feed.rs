use crate::fetcher::Fetcher;
use crate::parser::parse_search_page;
use crate::traits::FilingFeed;
use crate::types::{FetchConfig, FilingRef, Result, PAGE_SIZE};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Filing feed backed by the EDGAR full-text search index.
pub struct EdgarFeedSource {
    fetcher: Fetcher,
    page_delay: Duration,
    max_pages: u32,
}

impl EdgarFeedSource {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let page_delay = Duration::from_millis(config.page_delay_millis);
        let max_pages = config.max_pages.max(1);
        let fetcher = Fetcher::new(config)?;
        Ok(Self {
            fetcher,
            page_delay,
            max_pages,
        })
    }

    /// Read pages for one day until a short or empty page, `max_pages`, or `limit` filings.
    ///
    /// A failure on the first page is returned; later failures end the walk
    /// with whatever was collected so far.
    async fn collect_pages(&self, date: NaiveDate, max_pages: u32, limit: Option<usize>) -> Result<Vec<FilingRef>> {
        let mut filings = Vec::new();

        for page in 1..=max_pages {
            if page > 1 {
                tokio::time::sleep(self.page_delay).await;
            }

            let parsed = match self.fetcher.fetch_search_page(date, date, page).await {
                Ok(body) => parse_search_page(&body),
                Err(e) => Err(e),
            };

            let parsed = match parsed {
                Ok(parsed) => parsed,
                Err(e) if page == 1 => return Err(e),
                Err(e) => {
                    warn!("Stopping at page {} for {}: {}", page, date, e);
                    break;
                }
            };

            debug!("Page {} for {}: {} hits", page, date, parsed.hit_count);
            let hit_count = parsed.hit_count;
            filings.extend(parsed.filings);

            if let Some(limit) = limit {
                if filings.len() >= limit {
                    filings.truncate(limit);
                    break;
                }
            }
            if hit_count < PAGE_SIZE {
                break;
            }
        }

        Ok(filings)
    }
}

#[async_trait]
impl FilingFeed for EdgarFeedSource {
    fn source_name(&self) -> String {
        match url::Url::parse(&self.fetcher.config().search_url) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => format!("EDGAR search ({})", host),
                None => "EDGAR search".to_string(),
            },
            Err(_) => "EDGAR search".to_string(),
        }
    }

    async fn fetch_latest(&self, max_items: usize) -> Result<Vec<FilingRef>> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let today = Local::now().date_naive();
        let filings = self.collect_pages(today, self.max_pages, Some(max_items)).await?;
        info!("Fetched {} filings for {} from {}", filings.len(), today, self.source_name());
        Ok(filings)
    }

    async fn fetch_for_date(&self, date: NaiveDate, max_pages: u32) -> Result<Vec<FilingRef>> {
        let filings = self.collect_pages(date, max_pages.max(1), None).await?;
        info!("Fetched {} filings for {} from {}", filings.len(), date, self.source_name());
        Ok(filings)
    }
}
