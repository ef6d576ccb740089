use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::defs::ExtractedData;
use crate::defs::ExtractionError;
use crate::defs::Extractor;
use crate::defs::FilingRef;

fn check_documents(filing: &FilingRef) -> Result<&str, ExtractionError> {
    let primary = filing.primary_document()
        .ok_or_else(|| ExtractionError::Malformed(format!("{} lists no documents", filing.accession)))?;
    if !(primary.starts_with("https://") || primary.starts_with("http://")) {
        return Err(ExtractionError::Malformed(format!("{} has a non-http document url: {}", filing.accession, primary)));
    }
    Ok(primary)
}

fn describe_filing(filing: &FilingRef, primary_document: &str) -> serde_json::Value {
    json!({
        "form_type": filing.form_type,
        "cik": filing.company_id,
        "company_name": filing.company_name,
        "filing_date": filing.filing_date.map(|d| d.to_string()),
        "primary_document": primary_document,
        "document_urls": filing.document_urls,
    })
}

// Financial statement figures are left for form-specific extractors to fill.
fn blank_metrics() -> serde_json::Value {
    json!({
        "revenue": null,
        "net_income": null,
        "total_assets": null,
    })
}

/// Metadata-only extractor usable for any form type.
pub struct BaselineExtractor {
    form_type: String,
}

impl BaselineExtractor {
    pub fn new(form_type: impl Into<String>) -> Self {
        Self { form_type: form_type.into() }
    }
}

#[async_trait]
impl Extractor for BaselineExtractor {
    fn form_type(&self) -> String {
        self.form_type.clone()
    }

    async fn extract(&self, filing: &FilingRef) -> Result<ExtractedData, ExtractionError> {
        let primary_document = check_documents(filing)?;
        let mut payload = describe_filing(filing, primary_document);
        payload["metrics"] = blank_metrics();
        Ok(ExtractedData {
            accession: filing.accession.clone(),
            form_type: self.form_type.clone(),
            company_id: self.company_id(filing),
            payload,
            extracted_at: Utc::now(),
        })
    }
}
