use std::sync::LazyLock;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use quick_xml::events::Event;
use regex::Regex;
use tracing::{info, warn};

use super::DateWindow;
use crate::error::FetchError;
use crate::model::{InsiderTrade, OwnershipKind};

const FTS_URL: &str = "https://efts.sec.gov/LATEST/search-index";
const ARCHIVES_URL: &str = "https://www.sec.gov/Archives/edgar/data";
const FEED_URL: &str = "https://www.sec.gov/cgi-bin/browse-edgar";
// EDGAR asks automated clients to identify themselves and stay under rate.
const USER_AGENT: &str = "disclosure-etl/0.1 (ops@disclosure-etl.dev)";
const MIN_REQUEST_INTERVAL_MS: u64 = 350;
const REQUEST_TIMEOUT_SECS: u64 = 30;

static XML_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="([^"]+\.xml)""#).unwrap());

/// Form 4 ownership filings from EDGAR. Fully deterministic: the source is
/// already machine-readable XML, so this path produces typed records with no
/// model involvement. Discovery order: full-text search, then the latest
/// -filings feed, then an index page's embedded XML link.
pub struct EdgarClient {
    client: reqwest::Client,
    min_interval: Duration,
    last_request: tokio::sync::Mutex<Option<Instant>>,
}

impl EdgarClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            min_interval: Duration::from_millis(MIN_REQUEST_INTERVAL_MS),
            last_request: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn fetch_form4(
        &self,
        tickers: &[String],
        window: &DateWindow,
    ) -> Result<Vec<InsiderTrade>, FetchError> {
        let mut trades = Vec::new();
        for ticker in tickers {
            match self.fetch_for_ticker(ticker, window).await {
                Ok(mut t) => {
                    info!("{}: {} insider transactions", ticker, t.len());
                    trades.append(&mut t);
                }
                Err(e) => {
                    warn!("{}: insider fetch failed: {}", ticker, e);
                    return Err(e);
                }
            }
        }
        Ok(trades)
    }

    async fn fetch_for_ticker(
        &self,
        ticker: &str,
        window: &DateWindow,
    ) -> Result<Vec<InsiderTrade>, FetchError> {
        let docs = match self.search_filings(ticker, window).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(
                    "{}: full-text search unavailable ({}), using latest-filings feed",
                    ticker, e
                );
                self.feed_filings(ticker).await?
            }
        };

        let mut trades = Vec::new();
        for doc in docs {
            let url = doc.document_url();
            let xml = match self.get_text(&url).await {
                Ok(x) => x,
                Err(e) => {
                    warn!("Skipping {}: {}", url, e);
                    continue;
                }
            };
            match parse_form4(&xml, &doc.accession, &url) {
                Ok(mut t) => trades.append(&mut t),
                Err(e) => warn!("Skipping {}: {}", url, e),
            }
        }
        Ok(trades)
    }

    /// Full-text search: returns document coordinates (CIK, accession,
    /// filename) from which the canonical archive URL is built.
    async fn search_filings(
        &self,
        ticker: &str,
        window: &DateWindow,
    ) -> Result<Vec<FilingDoc>, FetchError> {
        let url = format!(
            "{}?q=%22{}%22&forms=4&dateRange=custom&startdt={}&enddt={}",
            FTS_URL, ticker, window.from, window.to
        );
        let body = self.get_text(&url).await?;
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| FetchError::Listing(format!("search response: {}", e)))?;

        let hits = value["hits"]["hits"]
            .as_array()
            .ok_or_else(|| FetchError::Listing("search response has no hits array".into()))?;

        let mut docs = Vec::new();
        for hit in hits {
            let id = hit["_id"].as_str().unwrap_or_default();
            let Some((accession, filename)) = id.split_once(':') else {
                continue;
            };
            let Some(cik) = hit["_source"]["ciks"]
                .as_array()
                .and_then(|c| c.first())
                .and_then(|c| c.as_str())
            else {
                continue;
            };
            docs.push(FilingDoc {
                cik: cik.to_string(),
                accession: accession.to_string(),
                filename: filename.to_string(),
            });
        }
        Ok(docs)
    }

    /// Fallback discovery: the per-issuer Atom feed lists filing index pages;
    /// each index page embeds a link to the ownership XML.
    async fn feed_filings(&self, ticker: &str) -> Result<Vec<FilingDoc>, FetchError> {
        let url = format!(
            "{}?action=getcompany&CIK={}&type=4&dateb=&owner=include&count=10&output=atom",
            FEED_URL, ticker
        );
        let atom = self.get_text(&url).await?;
        let index_urls = parse_atom_index_urls(&atom)?;
        if index_urls.is_empty() {
            return Err(FetchError::Listing(format!(
                "no filings in latest feed for {}",
                ticker
            )));
        }

        let mut docs = Vec::new();
        for index_url in index_urls {
            let html = match self.get_text(&index_url).await {
                Ok(h) => h,
                Err(e) => {
                    warn!("Skipping index {}: {}", index_url, e);
                    continue;
                }
            };
            if let Some(doc) = doc_from_index(&index_url, &html) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// One outbound request at a time with a fixed minimum spacing.
    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(FetchError::from)?
            .text()
            .await?)
    }
}

#[derive(Debug, PartialEq)]
struct FilingDoc {
    cik: String,
    accession: String,
    filename: String,
}

impl FilingDoc {
    fn document_url(&self) -> String {
        archive_url(&self.cik, &self.accession, &self.filename)
    }
}

fn archive_url(cik: &str, accession: &str, filename: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        ARCHIVES_URL,
        cik.trim_start_matches('0'),
        accession.replace('-', ""),
        filename
    )
}

/// Recover (CIK, accession, filename) from an index page URL plus the XML
/// link embedded in its HTML.
fn doc_from_index(index_url: &str, html: &str) -> Option<FilingDoc> {
    let xml_href = XML_LINK_RE
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .find(|href| !href.contains("index"))?;
    let filename = xml_href.rsplit('/').next()?.to_string();

    // .../edgar/data/<cik>/<accession-no-dashes>/<...>-index.htm
    let mut parts = index_url.rsplit('/');
    let _index_page = parts.next()?;
    let accession_packed = parts.next()?;
    let cik = parts.next()?;
    let accession = unpack_accession(accession_packed)?;

    Some(FilingDoc {
        cik: cik.to_string(),
        accession,
        filename,
    })
}

fn unpack_accession(packed: &str) -> Option<String> {
    if packed.len() != 18 || !packed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!(
        "{}-{}-{}",
        &packed[..10],
        &packed[10..12],
        &packed[12..]
    ))
}

fn parse_atom_index_urls(atom: &str) -> Result<Vec<String>, FetchError> {
    let mut reader = quick_xml::Reader::from_str(atom);
    let mut urls = Vec::new();
    let mut in_entry = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"entry" => in_entry = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"entry" => in_entry = false,
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if in_entry && e.name().as_ref() == b"link" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"href" {
                        urls.push(String::from_utf8_lossy(&attr.value).to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::Listing(format!("atom feed: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}

// ── Ownership document parsing ──

#[derive(Default)]
struct Form4Doc {
    issuer_name: String,
    ticker: String,
    owner_name: String,
    is_director: bool,
    is_officer: bool,
    is_ten_percent: bool,
    officer_title: Option<String>,
    period_of_report: Option<NaiveDate>,
    signature_date: Option<NaiveDate>,
}

struct PendingTx {
    is_derivative: bool,
    date: Option<NaiveDate>,
    code: Option<String>,
    shares: Option<f64>,
    price: Option<f64>,
    ownership: OwnershipKind,
}

impl PendingTx {
    fn new(is_derivative: bool) -> Self {
        Self {
            is_derivative,
            date: None,
            code: None,
            shares: None,
            price: None,
            ownership: OwnershipKind::Direct,
        }
    }
}

/// Deterministic parse of one Form 4 ownership document into insider trades:
/// issuer block, reporting-owner block, then every non-derivative and
/// derivative transaction block.
pub fn parse_form4(
    xml: &str,
    accession: &str,
    source_url: &str,
) -> Result<Vec<InsiderTrade>, FetchError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut doc = Form4Doc::default();
    let mut pending: Option<PendingTx> = None;
    let mut txs: Vec<PendingTx> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "nonDerivativeTransaction" => pending = Some(PendingTx::new(false)),
                    "derivativeTransaction" => pending = Some(PendingTx::new(true)),
                    _ => {}
                }
                stack.push(name);
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                let name = name.as_ref();
                if name == b"nonDerivativeTransaction" || name == b"derivativeTransaction" {
                    if let Some(tx) = pending.take() {
                        txs.push(tx);
                    }
                }
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| FetchError::Listing(format!("ownership XML: {}", e)))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    buf.clear();
                    continue;
                }
                let leaf = stack.last().map(String::as_str).unwrap_or("");
                let parent = stack.iter().rev().nth(1).map(String::as_str).unwrap_or("");
                collect_field(&mut doc, &mut pending, parent, leaf, &text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::Listing(format!("ownership XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    if doc.ticker.is_empty() || doc.owner_name.is_empty() {
        return Err(FetchError::Listing(
            "ownership XML missing issuer or reporting owner".into(),
        ));
    }
    let filing_date = doc
        .signature_date
        .or(doc.period_of_report)
        .ok_or_else(|| FetchError::Listing("ownership XML has no usable filing date".into()))?;

    let relationship = relationship_label(&doc);
    let mut trades = Vec::new();
    for tx in txs {
        let (Some(date), Some(code), Some(shares)) = (tx.date, tx.code.clone(), tx.shares) else {
            warn!("{}: transaction block missing date, code, or shares", accession);
            continue;
        };
        trades.push(InsiderTrade {
            insider_name: doc.owner_name.clone(),
            insider_relationship: relationship.clone(),
            issuer_name: doc.issuer_name.clone(),
            ticker: doc.ticker.clone(),
            transaction_date: date,
            transaction_code: code,
            shares,
            price_per_share: tx.price,
            ownership_kind: tx.ownership,
            is_derivative: tx.is_derivative,
            accession_no: accession.to_string(),
            filing_date,
            source_url: source_url.to_string(),
        });
    }
    Ok(trades)
}

fn collect_field(
    doc: &mut Form4Doc,
    pending: &mut Option<PendingTx>,
    parent: &str,
    leaf: &str,
    text: &str,
) {
    match (parent, leaf) {
        (_, "issuerName") => doc.issuer_name = text.to_string(),
        (_, "issuerTradingSymbol") => doc.ticker = text.to_uppercase(),
        (_, "rptOwnerName") => doc.owner_name = text.to_string(),
        (_, "officerTitle") => doc.officer_title = Some(text.to_string()),
        (_, "isDirector") if xml_bool(text) => doc.is_director = true,
        (_, "isOfficer") if xml_bool(text) => doc.is_officer = true,
        (_, "isTenPercentOwner") if xml_bool(text) => doc.is_ten_percent = true,
        (_, "periodOfReport") => doc.period_of_report = parse_xml_date(text),
        (_, "signatureDate") => doc.signature_date = parse_xml_date(text),
        ("transactionDate", "value") => {
            if let Some(tx) = pending {
                tx.date = parse_xml_date(text);
            }
        }
        (_, "transactionCode") => {
            if let Some(tx) = pending {
                tx.code = Some(text.to_string());
            }
        }
        ("transactionShares", "value") => {
            if let Some(tx) = pending {
                tx.shares = text.parse().ok();
            }
        }
        ("transactionPricePerShare", "value") => {
            if let Some(tx) = pending {
                tx.price = text.parse().ok();
            }
        }
        ("directOrIndirectOwnership", "value") => {
            if let Some(tx) = pending {
                tx.ownership = if text.eq_ignore_ascii_case("I") {
                    OwnershipKind::Indirect
                } else {
                    OwnershipKind::Direct
                };
            }
        }
        _ => {}
    }
}

fn relationship_label(doc: &Form4Doc) -> String {
    if doc.is_officer {
        doc.officer_title
            .clone()
            .unwrap_or_else(|| "Officer".to_string())
    } else if doc.is_director {
        "Director".to_string()
    } else if doc.is_ten_percent {
        "10% Owner".to_string()
    } else {
        "Other".to_string()
    }
}

fn xml_bool(text: &str) -> bool {
    text == "1" || text.eq_ignore_ascii_case("true")
}

fn parse_xml_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}
