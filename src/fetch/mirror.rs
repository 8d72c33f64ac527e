use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use super::{DateWindow, Source, PAGE_DELAY_MS};
use crate::error::FetchError;
use crate::model::{FetchResult, SourceKind};

const DEFAULT_BASE_URL: &str = "https://www.capitoltrades.com";
const REQUEST_TIMEOUT_SECS: u64 = 30;

static TRADE_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href="/politicians/|href="/trades/"#).unwrap());

/// Public aggregator mirroring the congressional disclosures with its own
/// layout. Only consulted when the primary source yields nothing.
pub struct MirrorSource {
    client: reqwest::Client,
    base_url: String,
    max_pages: usize,
}

impl MirrorSource {
    pub fn new(max_pages: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            max_pages,
        })
    }
}

#[async_trait]
impl Source for MirrorSource {
    fn name(&self) -> &'static str {
        "mirror"
    }

    async fn fetch(&self, _window: &DateWindow) -> Result<Vec<FetchResult>, FetchError> {
        let mut results = Vec::new();

        for page in 1..=self.max_pages {
            let url = format!("{}/trades?page={}&pageSize=96", self.base_url, page);
            let html = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()
                .map_err(FetchError::from)?
                .text()
                .await?;

            if !has_trade_rows(&html) {
                break;
            }

            let mut metadata = HashMap::new();
            metadata.insert("mirror".to_string(), "1".to_string());
            metadata.insert("page".to_string(), page.to_string());

            results.push(FetchResult {
                source_kind: SourceKind::MirrorHtml,
                content: html.into_bytes(),
                content_type: "text/html".to_string(),
                source_url: url,
                metadata,
            });

            tokio::time::sleep(Duration::from_millis(PAGE_DELAY_MS)).await;
        }

        info!("Mirror produced {} pages of trades", results.len());
        Ok(results)
    }
}

fn has_trade_rows(html: &str) -> bool {
    TRADE_ROW_RE.is_match(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_rows_detected() {
        let html = r#"<tr><td><a href="/politicians/P000197">N. Pelosi</a></td>
                      <td>AAPL</td><td>50K-100K</td></tr>"#;
        assert!(has_trade_rows(html));
    }

    #[test]
    fn empty_page_detected() {
        assert!(!has_trade_rows("<html><body>No more results.</body></html>"));
    }
}
