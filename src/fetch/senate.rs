use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{info, warn};

use super::{DateWindow, Source, PAGE_DELAY_MS};
use crate::error::FetchError;
use crate::model::{FetchResult, SourceKind};

const SEARCH_URL: &str = "https://efdsearch.senate.gov/search/";

static ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]+)\]\((https://efdsearch\.senate\.gov/search/view/[^)\s]+)\)").unwrap()
});
static ROW_DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{2}/\d{2}/\d{4}").unwrap());

/// Periodic transaction reports from the Senate's electronic disclosure
/// search. The site sits behind bot-mitigation an ordinary HTTP client cannot
/// pass, so every page load goes through a real browser session.
pub struct SenateSource {
    api_key: String,
    max_filings: usize,
}

impl SenateSource {
    pub fn new(api_key: String, max_filings: usize) -> Self {
        Self {
            api_key,
            max_filings,
        }
    }

    pub fn from_env(max_filings: usize) -> Result<Self, FetchError> {
        let api_key = std::env::var("SPIDER_API_KEY")
            .map_err(|_| FetchError::Blocked("SPIDER_API_KEY environment variable not set".into()))?;
        Ok(Self::new(api_key, max_filings))
    }
}

struct ListingRow {
    politician_name: String,
    filing_date: Option<String>,
    url: String,
}

#[async_trait]
impl Source for SenateSource {
    fn name(&self) -> &'static str {
        "senate-efd"
    }

    async fn fetch(&self, window: &DateWindow) -> Result<Vec<FetchResult>, FetchError> {
        let spider = Spider::new(Some(self.api_key.clone()))
            .map_err(|e| FetchError::Blocked(format!("browser session: {}", e)))?;

        let search_url = search_url(window);
        info!("Searching Senate disclosures: {}", search_url);
        let listing = scrape_page(&spider, &search_url).await?;

        let rows = parse_listing(&listing);
        if rows.is_empty() {
            info!("Senate search returned no filings for the window");
            return Ok(Vec::new());
        }
        info!("Senate search returned {} filings", rows.len());

        let mut results = Vec::new();
        for row in rows.into_iter().take(self.max_filings) {
            // Polite pacing keeps the session below anti-automation thresholds.
            tokio::time::sleep(Duration::from_millis(PAGE_DELAY_MS)).await;

            let page = match scrape_page(&spider, &row.url).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping filing {}: {}", row.url, e);
                    continue;
                }
            };

            let mut metadata = HashMap::new();
            metadata.insert("politician_name".to_string(), row.politician_name);
            metadata.insert("chamber".to_string(), "Senate".to_string());
            if let Some(date) = row.filing_date {
                metadata.insert("filing_date".to_string(), date);
            }

            results.push(FetchResult {
                source_kind: SourceKind::SenateHtml,
                content: page.into_bytes(),
                content_type: "text/markdown".to_string(),
                source_url: row.url,
                metadata,
            });
        }
        Ok(results)
    }
}

fn search_url(window: &DateWindow) -> String {
    let from = window.from.format("%m/%d/%Y").to_string().replace('/', "%2F");
    let to = window.to.format("%m/%d/%Y").to_string().replace('/', "%2F");
    format!(
        "{}?filer_type=1&report_type=11&submitted_start_date={}&submitted_end_date={}",
        SEARCH_URL, from, to
    )
}

/// The search results page rendered to markdown: one filing per row, the
/// filer name linking to the filing view, with the submission date nearby.
fn parse_listing(markdown: &str) -> Vec<ListingRow> {
    let mut rows = Vec::new();
    for line in markdown.lines() {
        for caps in ROW_RE.captures_iter(line) {
            let name = caps[1].trim().to_string();
            if name.is_empty() {
                continue;
            }
            rows.push(ListingRow {
                politician_name: name,
                filing_date: ROW_DATE_RE.find(line).map(|m| m.as_str().to_string()),
                url: caps[2].to_string(),
            });
        }
    }
    rows
}

async fn scrape_page(spider: &Spider, url: &str) -> Result<String, FetchError> {
    let params = RequestParams {
        return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
        ..Default::default()
    };

    let response = spider
        .scrape_url(url, Some(params), "application/json")
        .await
        .map_err(|e| FetchError::Network(format!("browser fetch {}: {}", url, e)))?;

    let parsed: serde_json::Value = match response.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
        None => response,
    };

    parsed
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| FetchError::Blocked(format!("no content returned for {}", url)))
}
