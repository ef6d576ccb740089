use crate::types::{FetchConfig, PipelineError, Result, PAGE_SIZE};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::NaiveDate;
use reqwest::{header, Client, Response, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// HTTP client for the EDGAR full-text search index.
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            return Err(PipelineError::Config("a contact User-Agent is required by sec.gov".to_string()));
        }

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch one page of search results covering `start..=end` filing dates.
    ///
    /// Pages are 1-based. Transport errors and non-success statuses are
    /// retried with exponential backoff; the final failure is reported as
    /// `TransientFetch`.
    pub async fn fetch_search_page(&self, start: NaiveDate, end: NaiveDate, page: u32) -> Result<String> {
        let started = Instant::now();
        let delay = Duration::from_millis(self.config.retry_delay_millis);

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: delay,
            initial_interval: delay,
            max_interval: delay * 16,
            multiplier: 2.0,
            max_elapsed_time: Some(delay * 60),
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.send_search_request(start, end, page).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        match response.text().await {
                            Ok(body) => {
                                debug!(
                                    "Fetched search page {} for {}..{} ({} bytes, {} ms)",
                                    page,
                                    start,
                                    end,
                                    body.len(),
                                    started.elapsed().as_millis()
                                );
                                return Ok(body);
                            }
                            Err(e) => last_error = Some(PipelineError::from(e)),
                        }
                    } else {
                        last_error = Some(PipelineError::TransientFetch(format!(
                            "HTTP {}: {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("Unknown")
                        )));

                        // A client error other than rate limiting will not fix itself
                        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                            break;
                        }
                    }
                }
                Err(e) => last_error = Some(e),
            }

            if attempt < self.config.max_retries {
                if let Some(wait) = backoff.next_backoff() {
                    warn!("Attempt {} failed for search page {}, retrying in {:?}", attempt + 1, page, wait);
                    tokio::time::sleep(wait).await;
                    continue;
                }
            }
            break;
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());
        error!("Failed to fetch search page {} for {}..{}: {}", page, start, end, message);
        Err(PipelineError::TransientFetch(message))
    }

    async fn send_search_request(&self, start: NaiveDate, end: NaiveDate, page: u32) -> Result<Response> {
        let from = (page.saturating_sub(1) as usize) * PAGE_SIZE;
        let query = [
            ("forms", "-0".to_string()),
            ("startdt", start.format("%Y-%m-%d").to_string()),
            ("enddt", end.format("%Y-%m-%d").to_string()),
            ("page", page.to_string()),
            ("from", from.to_string()),
        ];

        let response = self
            .client
            .get(&self.config.search_url)
            .header(header::ACCEPT, "application/json")
            .query(&query)
            .send()
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            info!("Search index is rate limiting requests");
        }
        Ok(response)
    }
}
