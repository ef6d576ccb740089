//! EDGAR-specific helpers shared by the feed source and the CLI

/// Archive URL helpers
pub mod url {
    use crate::types::ARCHIVES_BASE_URL;
    use url::Url;

    /// Strip the zero padding the search index puts on CIKs.
    pub fn unpadded_cik(cik: &str) -> &str {
        let trimmed = cik.trim().trim_start_matches('0');
        if trimmed.is_empty() && !cik.trim().is_empty() {
            "0"
        } else {
            trimmed
        }
    }

    /// Archive location of a filing document, e.g.
    /// `.../edgar/data/320193/000032019324000123/aapl-20240928.htm`.
    pub fn build_document_url(cik: &str, accession: &str, primary_document: &str) -> Option<String> {
        let cik = unpadded_cik(cik);
        let folder: String = accession.chars().filter(|c| *c != '-').collect();
        let primary_document = primary_document.trim();
        if cik.is_empty() || folder.is_empty() || primary_document.is_empty() {
            return None;
        }

        let raw = format!("{}/{}/{}/{}", ARCHIVES_BASE_URL, cik, folder, primary_document);
        Url::parse(&raw).ok().map(String::from)
    }

    /// Check that an endpoint is an absolute http(s) URL
    pub fn is_http_url(url_str: &str) -> bool {
        match Url::parse(url_str) {
            Ok(url) => url.scheme() == "http" || url.scheme() == "https",
            Err(_) => false,
        }
    }
}

/// Calendar helpers for polling and backfill
pub mod time {
    use chrono::{Datelike, Duration, NaiveDate, Weekday};

    pub fn is_business_day(date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Weekdays among the `days_back` days before `today`, oldest first.
    /// `today` itself is excluded.
    pub fn business_days(today: NaiveDate, days_back: u32) -> Vec<NaiveDate> {
        let mut days: Vec<NaiveDate> = (1..=i64::from(days_back))
            .map(|offset| today - Duration::days(offset))
            .filter(|date| is_business_day(*date))
            .collect();
        days.reverse();
        days
    }

    /// Format duration in human-readable form
    pub fn format_duration(duration: std::time::Duration) -> String {
        let total_seconds = duration.as_secs();

        if total_seconds < 60 {
            format!("{}s", total_seconds)
        } else if total_seconds < 3600 {
            format!("{}m", total_seconds / 60)
        } else {
            format!("{}h", total_seconds / 3600)
        }
    }
}
