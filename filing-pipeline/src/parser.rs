use crate::edgar_utils;
use crate::types::{FilingRef, PipelineError, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(rename = "_source")]
    source: HitSource,
}

#[derive(Debug, Deserialize)]
struct HitSource {
    adsh: Option<String>,
    form: Option<String>,
    #[serde(default)]
    ciks: Vec<String>,
    #[serde(rename = "companyName")]
    company_name: Option<String>,
    #[serde(default)]
    display_names: Vec<String>,
    #[serde(rename = "filingDate")]
    filing_date: Option<String>,
    file_date: Option<String>,
    #[serde(rename = "filingHref")]
    filing_href: Option<String>,
}

/// One decoded page of the search index.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub filings: Vec<FilingRef>,
    /// Raw hit count before malformed entries were dropped; drives pagination.
    pub hit_count: usize,
    pub skipped: usize,
}

/// Decode a search-index response body.
///
/// A body that is not the expected envelope is a `Parse` error. Individual
/// hits that lack an accession, form type, CIK or any usable document URL
/// are dropped with a warning.
pub fn parse_search_page(body: &str) -> Result<SearchPage> {
    let response: SearchResponse =
        serde_json::from_str(body).map_err(|e| PipelineError::Parse(format!("Failed to parse search response: {}", e)))?;

    let mut page = SearchPage {
        hit_count: response.hits.hits.len(),
        ..Default::default()
    };

    for raw in response.hits.hits {
        let hit: Hit = match serde_json::from_value(raw) {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Skipping undecodable search hit: {}", e);
                page.skipped += 1;
                continue;
            }
        };

        match filing_from_hit(hit) {
            Some(filing) => page.filings.push(filing),
            None => page.skipped += 1,
        }
    }

    debug!("Parsed {} filings from {} hits", page.filings.len(), page.hit_count);
    Ok(page)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// "Apple Inc.  (AAPL)  (CIK 0000320193)" -> "Apple Inc.  (AAPL)"
fn clean_display_name(name: &str) -> String {
    match name.find("(CIK") {
        Some(idx) => name[..idx].trim().to_string(),
        None => name.trim().to_string(),
    }
}

fn filing_from_hit(hit: Hit) -> Option<FilingRef> {
    let source = hit.source;

    let Some(accession) = non_blank(source.adsh) else {
        warn!("Skipping search hit {} without an accession number", hit.id);
        return None;
    };
    let Some(form_type) = non_blank(source.form) else {
        warn!("Skipping {} without a form type", accession);
        return None;
    };
    let Some(company_id) = source.ciks.into_iter().find_map(|c| non_blank(Some(c))) else {
        warn!("Skipping {} without a CIK", accession);
        return None;
    };

    let company_name = non_blank(source.company_name)
        .or_else(|| source.display_names.first().map(|n| clean_display_name(n)).filter(|n| !n.is_empty()));

    let filing_date = non_blank(source.filing_date)
        .or_else(|| non_blank(source.file_date))
        .and_then(|raw| match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                debug!("Unparseable filing date {:?} on {}", raw, accession);
                None
            }
        });

    // The document id is "<accession>:<primary document>"
    let mut document_urls = Vec::new();
    if let Some((_, primary)) = hit.id.split_once(':') {
        if let Some(url) = edgar_utils::url::build_document_url(&company_id, &accession, primary) {
            document_urls.push(url);
        }
    }
    if let Some(href) = non_blank(source.filing_href) {
        if edgar_utils::url::is_http_url(&href) && !document_urls.contains(&href) {
            document_urls.push(href);
        }
    }
    if document_urls.is_empty() {
        warn!("Skipping {} without a document location", accession);
        return None;
    }

    Some(FilingRef {
        accession,
        company_id,
        company_name,
        form_type,
        filing_date,
        document_urls,
    })
}
