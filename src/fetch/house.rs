use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Datelike;
use regex::Regex;
use tracing::{info, warn};

use super::{DateWindow, Source, PAGE_DELAY_MS};
use crate::error::FetchError;
use crate::model::{FetchResult, SourceKind};

const BASE_URL: &str = "https://disclosures-clerk.house.gov";
const SEARCH_PATH: &str = "/FinancialDisclosure/ViewMemberSearchResult";
const REQUEST_TIMEOUT_SECS: u64 = 60;

static ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<a\s+href="([^"]*ptr-pdfs/\d{4}/\d+\.pdf)"[^>]*>([^<]+)</a>.*?(\d{1,2}/\d{1,2}/\d{4})"#,
    )
    .unwrap()
});

/// House periodic transaction reports: an AJAX search form returning an HTML
/// table, one scanned PDF per filing. The PDF bytes are returned untouched;
/// reading them is the transformer's job.
pub struct HouseSource {
    client: reqwest::Client,
    max_filings: usize,
}

impl HouseSource {
    pub fn new(max_filings: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            max_filings,
        })
    }
}

struct ListingRow {
    politician_name: String,
    filing_date: String,
    pdf_url: String,
}

#[async_trait]
impl Source for HouseSource {
    fn name(&self) -> &'static str {
        "house-clerk"
    }

    async fn fetch(&self, window: &DateWindow) -> Result<Vec<FetchResult>, FetchError> {
        let year = window.to.year().to_string();
        let html = self
            .client
            .post(format!("{}{}", BASE_URL, SEARCH_PATH))
            .form(&[("LastName", ""), ("FilingYear", year.as_str())])
            .send()
            .await?
            .error_for_status()
            .map_err(FetchError::from)?
            .text()
            .await?;

        let rows = parse_listing(&html);
        if rows.is_empty() {
            info!("House search returned no PTR filings for {}", year);
            return Ok(Vec::new());
        }
        info!("House search returned {} PTR filings", rows.len());

        let mut results = Vec::new();
        for row in rows.into_iter().take(self.max_filings) {
            tokio::time::sleep(Duration::from_millis(PAGE_DELAY_MS)).await;

            let pdf = match self.download_pdf(&row.pdf_url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping PDF {}: {}", row.pdf_url, e);
                    continue;
                }
            };

            let mut metadata = HashMap::new();
            metadata.insert("politician_name".to_string(), row.politician_name);
            metadata.insert("filing_date".to_string(), row.filing_date);
            metadata.insert("chamber".to_string(), "House".to_string());

            results.push(FetchResult {
                source_kind: SourceKind::HousePdf,
                content: pdf,
                content_type: "application/pdf".to_string(),
                source_url: row.pdf_url,
                metadata,
            });
        }
        Ok(results)
    }
}

impl HouseSource {
    async fn download_pdf(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(FetchError::from)?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

fn parse_listing(html: &str) -> Vec<ListingRow> {
    ROW_RE
        .captures_iter(html)
        .map(|caps| ListingRow {
            politician_name: caps[2].trim().to_string(),
            filing_date: caps[3].to_string(),
            pdf_url: absolute_url(&caps[1]),
        })
        .collect()
}

fn absolute_url(href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", BASE_URL, href)
    } else {
        format!("{}/{}", BASE_URL, href)
    }
}
