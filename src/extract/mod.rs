pub mod json;
pub mod prompts;

use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::TransformError;
use crate::llm::LlmClient;
use crate::model::{
    has_currency_marker, normalize_ticker, Chamber, ExtractionResult, FetchResult, OwnerKind,
    TradeRecord, TransactionType,
};
use prompts::strategy_for;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Turns one fetched document into validated trade records via the model
/// boundary. Owns prompt selection, schema validation, the retry loop with
/// error feedback, and the date-sanity correction pass.
pub struct Transformer {
    llm: Arc<dyn LlmClient>,
    max_retries: u32,
}

impl Transformer {
    pub fn new(llm: Arc<dyn LlmClient>, max_retries: u32) -> Self {
        Self { llm, max_retries }
    }

    pub async fn transform(&self, doc: &FetchResult) -> Result<ExtractionResult, TransformError> {
        let strategy = strategy_for(doc.source_kind)
            .ok_or(TransformError::NoStrategy(doc.source_kind.as_str()))?;
        let prompt = strategy.build(doc);

        let mut feedback: Option<String> = None;
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            let text = match &feedback {
                Some(err) => format!(
                    "{}\n\nYour previous response was rejected: {}\n\
                     Return corrected JSON following the schema exactly.",
                    prompt.text, err
                ),
                None => prompt.text.clone(),
            };

            let response = match self.llm.generate(&text, &prompt.attachments).await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "Model call failed for {} (attempt {}/{}): {}",
                        doc.source_url, attempt, self.max_retries, last_error
                    );
                    feedback = Some(last_error.clone());
                    continue;
                }
            };

            match parse_response(&response, doc, strategy.source_format()) {
                Ok(mut result) => {
                    let today = Utc::now().date_naive();
                    for rec in &mut result.records {
                        correct_dates(rec, today);
                    }
                    if result.records.len() < result.raw_record_count {
                        warn!(
                            "Possible omission for {}: extracted {} of {} visible records",
                            doc.source_url,
                            result.records.len(),
                            result.raw_record_count
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    warn!(
                        "Rejected model output for {} (attempt {}/{}): {}",
                        doc.source_url, attempt, self.max_retries, e
                    );
                    last_error = e;
                    feedback = Some(last_error.clone());
                }
            }
        }

        Err(TransformError::Exhausted {
            attempts: self.max_retries,
            last_error,
        })
    }
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default)]
    politician_name: Option<String>,
    #[serde(default)]
    chamber: Option<String>,
    transaction_date: String,
    #[serde(default)]
    filing_date: Option<String>,
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default)]
    asset_name: Option<String>,
    #[serde(default)]
    asset_type: Option<String>,
    transaction_type: String,
    amount_range: String,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    comment: Option<String>,
}

fn parse_response(
    response: &str,
    doc: &FetchResult,
    source_format: &str,
) -> Result<ExtractionResult, String> {
    let value = json::extract_json(response)?;
    let obj = value
        .as_object()
        .ok_or_else(|| "top-level JSON must be an object".to_string())?;

    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| "missing numeric \"confidence\"".to_string())?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence {} is outside [0, 1]", confidence));
    }

    let raw_records: Vec<RawRecord> = serde_json::from_value(
        obj.get("records")
            .cloned()
            .ok_or_else(|| "missing \"records\" array".to_string())?,
    )
    .map_err(|e| format!("records array does not match the schema: {}", e))?;

    let raw_record_count = obj
        .get("raw_record_count")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(raw_records.len());

    let mut records = Vec::with_capacity(raw_records.len());
    let mut errors = Vec::new();
    for (i, raw) in raw_records.into_iter().enumerate() {
        match validate_record(raw, doc) {
            Ok(rec) => records.push(rec),
            Err(e) => errors.push(format!("record {}: {}", i + 1, e)),
        }
    }
    if !errors.is_empty() {
        return Err(errors.join("; "));
    }

    Ok(ExtractionResult {
        records,
        source_format: source_format.to_string(),
        confidence,
        raw_record_count,
    })
}

fn validate_record(raw: RawRecord, doc: &FetchResult) -> Result<TradeRecord, String> {
    let politician_name = raw
        .politician_name
        .filter(|s| !s.trim().is_empty())
        .or_else(|| doc.meta("politician_name").map(str::to_string))
        .ok_or("missing politician_name")?;

    let chamber_raw = raw
        .chamber
        .or_else(|| doc.meta("chamber").map(str::to_string))
        .ok_or("missing chamber")?;
    let chamber = Chamber::parse(&chamber_raw)
        .ok_or_else(|| format!("chamber {:?} is not Senate or House", chamber_raw))?;

    let transaction_date = parse_date(&raw.transaction_date)
        .ok_or_else(|| format!("transaction_date {:?} is not a date", raw.transaction_date))?;

    let filing_raw = raw
        .filing_date
        .or_else(|| doc.meta("filing_date").map(str::to_string))
        .ok_or("missing filing_date")?;
    let filing_date =
        parse_date(&filing_raw).ok_or_else(|| format!("filing_date {:?} is not a date", filing_raw))?;

    let ticker = raw.ticker.as_deref().and_then(normalize_ticker);

    let asset_name = raw
        .asset_name
        .filter(|s| !s.trim().is_empty())
        .or_else(|| ticker.clone())
        .ok_or("missing asset_name")?;

    let transaction_type = TransactionType::parse(&raw.transaction_type).ok_or_else(|| {
        format!(
            "transaction_type {:?} is not Buy, Sale, or Exchange",
            raw.transaction_type
        )
    })?;

    if !has_currency_marker(&raw.amount_range) {
        return Err(format!(
            "amount_range {:?} has no currency marker",
            raw.amount_range
        ));
    }

    let owner = match raw.owner.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(
            OwnerKind::parse(s).ok_or_else(|| format!("owner {:?} is not a known holder", s))?,
        ),
    };

    Ok(TradeRecord {
        politician_name,
        chamber,
        transaction_date,
        filing_date,
        ticker,
        asset_name,
        asset_type: raw.asset_type.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| "Stock".into()),
        transaction_type,
        amount_range: raw.amount_range,
        owner,
        comment: raw.comment.filter(|s| !s.trim().is_empty()),
        source_url: doc.source_url.clone(),
    })
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%m/%d/%Y"))
        .ok()
}

/// Deterministic year-rollover repair. A future transaction date, or one far
/// past its filing date, is most often a misread year on the document.
pub fn correct_dates(rec: &mut TradeRecord, today: NaiveDate) {
    if rec.transaction_date > today {
        let corrected = roll_back_one_year(rec.transaction_date);
        warn!(
            "{}: transaction_date {} is in the future, correcting to {}",
            rec.politician_name, rec.transaction_date, corrected
        );
        rec.transaction_date = corrected;
    }
    if rec.transaction_date > rec.filing_date + Duration::days(60) {
        let corrected = roll_back_one_year(rec.transaction_date);
        warn!(
            "{}: transaction_date {} trails filing_date {} by more than 60 days, correcting to {}",
            rec.politician_name, rec.transaction_date, rec.filing_date, corrected
        );
        rec.transaction_date = corrected;
    }
    if rec.filing_date > today {
        let corrected = roll_back_one_year(rec.filing_date);
        warn!(
            "{}: filing_date {} is in the future, correcting to {}",
            rec.politician_name, rec.filing_date, corrected
        );
        rec.filing_date = corrected;
    }
}

fn roll_back_one_year(d: NaiveDate) -> NaiveDate {
    // Feb 29 has no previous-year counterpart
    d.with_year(d.year() - 1)
        .unwrap_or_else(|| d - Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::llm::Attachment;
    use crate::model::SourceKind;

    /// Scripted model: pops the next canned response, repeating the last one
    /// forever. Records every prompt it receives.
    struct MockLlm {
        responses: Mutex<Vec<String>>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl MockLlm {
        fn new(responses: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn generate(&self, prompt: &str, _attachments: &[Attachment]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses[0].clone())
            }
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    fn senate_doc() -> FetchResult {
        let mut metadata = HashMap::new();
        metadata.insert("politician_name".into(), "A. Smith".into());
        metadata.insert("filing_date".into(), "2025-01-20".into());
        metadata.insert("chamber".into(), "Senate".into());
        FetchResult {
            source_kind: SourceKind::SenateHtml,
            content: b"<table><tr><td>AAPL</td></tr></table>".to_vec(),
            content_type: "text/html".into(),
            source_url: "https://example.test/filing/1".into(),
            metadata,
        }
    }

    fn good_response() -> String {
        r#"{
            "records": [{
                "politician_name": "A. Smith",
                "chamber": "Senate",
                "transaction_date": "2025-01-10",
                "filing_date": "2025-01-20",
                "ticker": "aapl",
                "asset_name": "Apple Inc.",
                "asset_type": "Stock",
                "transaction_type": "Purchase",
                "amount_range": "$15,001 - $50,000",
                "owner": "Self",
                "comment": null
            }],
            "confidence": 0.95,
            "raw_record_count": 1
        }"#
        .to_string()
    }

    #[tokio::test]
    async fn valid_output_accepted_first_try() {
        let llm = MockLlm::new(vec![]);
        llm.responses.lock().unwrap().push(good_response());
        let t = Transformer::new(llm.clone(), 3);
        let result = t.transform(&senate_doc()).await.unwrap();

        assert_eq!(llm.call_count(), 1);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.source_format, "senate_html");
        let rec = &result.records[0];
        assert_eq!(rec.ticker.as_deref(), Some("AAPL"));
        assert_eq!(rec.transaction_type, TransactionType::Buy);
        assert_eq!(rec.owner, Some(OwnerKind::Principal));
        assert_eq!(rec.source_url, "https://example.test/filing/1");
    }

    #[tokio::test]
    async fn unparsable_output_spends_exactly_the_retry_budget() {
        let llm = MockLlm::new(vec!["I see no trades here."]);
        let t = Transformer::new(llm.clone(), 3);
        let err = t.transform(&senate_doc()).await.unwrap_err();

        assert_eq!(llm.call_count(), 3);
        match err {
            TransformError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn validation_error_is_fed_back_into_the_retry() {
        let bad = good_response().replace("Purchase", "Gift");
        let llm = MockLlm::new(vec![&bad, &good_response()]);
        let t = Transformer::new(llm.clone(), 3);
        let result = t.transform(&senate_doc()).await.unwrap();

        assert_eq!(llm.call_count(), 2);
        assert_eq!(result.records.len(), 1);
        let prompts = llm.prompts.lock().unwrap();
        assert!(!prompts[0].contains("rejected"));
        assert!(prompts[1].contains("rejected"));
        assert!(prompts[1].contains("transaction_type"));
    }

    #[tokio::test]
    async fn metadata_fills_missing_context_fields() {
        let resp = r#"{
            "records": [{
                "transaction_date": "2025-01-10",
                "ticker": "MSFT",
                "asset_name": "Microsoft",
                "transaction_type": "Sale",
                "amount_range": "$1,001 - $15,000"
            }],
            "confidence": 0.9,
            "raw_record_count": 1
        }"#;
        let llm = MockLlm::new(vec![resp]);
        let t = Transformer::new(llm, 3);
        let result = t.transform(&senate_doc()).await.unwrap();
        let rec = &result.records[0];
        assert_eq!(rec.politician_name, "A. Smith");
        assert_eq!(rec.chamber, Chamber::Senate);
        assert_eq!(rec.filing_date, NaiveDate::from_ymd_opt(2025, 1, 20).unwrap());
    }

    #[tokio::test]
    async fn future_transaction_date_is_rolled_back() {
        let today = Utc::now().date_naive();
        let future = today + Duration::days(365);
        let filing = today - Duration::days(5);
        let resp = format!(
            r#"{{
                "records": [{{
                    "transaction_date": "{future}",
                    "filing_date": "{filing}",
                    "ticker": "AAPL",
                    "asset_name": "Apple",
                    "transaction_type": "Buy",
                    "amount_range": "$1,001 - $15,000"
                }}],
                "confidence": 0.9,
                "raw_record_count": 1
            }}"#
        );
        let llm = MockLlm::new(vec![&resp]);
        let t = Transformer::new(llm, 3);
        let result = t.transform(&senate_doc()).await.unwrap();
        assert!(result.records[0].transaction_date <= today);
    }

    #[tokio::test]
    async fn under_extraction_is_surfaced_not_fatal() {
        let resp = good_response().replace("\"raw_record_count\": 1", "\"raw_record_count\": 4");
        let llm = MockLlm::new(vec![&resp]);
        let t = Transformer::new(llm, 3);
        let result = t.transform(&senate_doc()).await.unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.raw_record_count, 4);
    }

    #[tokio::test]
    async fn insider_documents_have_no_strategy() {
        let llm = MockLlm::new(vec!["{}"]);
        let t = Transformer::new(llm, 3);
        let mut doc = senate_doc();
        doc.source_kind = SourceKind::InsiderXml;
        assert!(matches!(
            t.transform(&doc).await,
            Err(TransformError::NoStrategy(_))
        ));
    }

    #[test]
    fn stale_transaction_date_rolled_back_a_year() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let mut rec = TradeRecord {
            politician_name: "A. Smith".into(),
            chamber: Chamber::Senate,
            transaction_date: NaiveDate::from_ymd_opt(2025, 5, 10).unwrap(),
            filing_date: NaiveDate::from_ymd_opt(2024, 5, 20).unwrap(),
            ticker: None,
            asset_name: "Bond".into(),
            asset_type: "Bond".into(),
            transaction_type: TransactionType::Buy,
            amount_range: "$1,001 - $15,000".into(),
            owner: None,
            comment: None,
            source_url: "u".into(),
        };
        correct_dates(&mut rec, today);
        assert_eq!(
            rec.transaction_date,
            NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()
        );
    }

    #[test]
    fn leap_day_rollback_does_not_panic() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let rolled = roll_back_one_year(d);
        assert_eq!(rolled.year(), 2023);
    }

    #[test]
    fn confidence_out_of_range_is_rejected() {
        let doc = senate_doc();
        let resp = good_response().replace("0.95", "1.4");
        assert!(parse_response(&resp, &doc, "senate_html")
            .unwrap_err()
            .contains("outside"));
    }
}
