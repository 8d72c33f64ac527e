use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::db::{self, BatchStatus, LogEntry};
use crate::model::{ExtractionResult, InsiderTrade, TradeRecord};

pub struct LoadConfig {
    /// Batches below this confidence are withheld for manual review.
    pub confidence_threshold: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct LoadOutcome {
    pub new: usize,
    pub skipped: usize,
    pub status: BatchStatus,
}

/// Load one extraction batch into the canonical store.
///
/// Identity is the content-derived dedup hash, so replaying the same batch
/// any number of times leaves the row set unchanged. A uniqueness hit is a
/// normal `skipped` outcome, not an error. Exactly one extraction_log row is
/// written per call.
pub fn load(
    conn: &Connection,
    result: &ExtractionResult,
    source_url: &str,
    cfg: &LoadConfig,
) -> Result<LoadOutcome> {
    // Confidence gate: low-confidence batches never touch the trade table.
    if result.confidence < cfg.confidence_threshold {
        warn!(
            "Confidence {:.2} below threshold {:.2} for {} — withholding {} records for manual review",
            result.confidence,
            cfg.confidence_threshold,
            source_url,
            result.records.len()
        );
        db::log_extraction(
            conn,
            &LogEntry {
                source_type: result.source_format.clone(),
                source_url: source_url.to_string(),
                confidence: Some(result.confidence),
                raw_record_count: Some(result.raw_record_count as i64),
                extracted_count: Some(result.records.len() as i64),
                status: BatchStatus::ManualReview,
                error_message: None,
            },
        )?;
        return Ok(LoadOutcome {
            new: 0,
            skipped: result.records.len(),
            status: BatchStatus::ManualReview,
        });
    }

    let today = Utc::now().date_naive();
    let mut new = 0usize;
    let mut skipped = 0usize;
    let mut anomalies: Vec<String> = Vec::new();

    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO trades
             (dedup_hash, politician_name, chamber, transaction_date, filing_date,
              ticker, asset_name, asset_type, transaction_type, amount_range,
              owner, comment, source_url, source_format, extraction_confidence)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        )?;
        for rec in &result.records {
            for violation in check_dates(rec, today) {
                warn!("{}: {}", rec.politician_name, violation);
                anomalies.push(violation);
            }
            let inserted = stmt.execute(rusqlite::params![
                rec.dedup_hash(),
                rec.politician_name,
                rec.chamber.as_str(),
                rec.transaction_date.to_string(),
                rec.filing_date.to_string(),
                rec.ticker,
                rec.asset_name,
                rec.asset_type,
                rec.transaction_type.as_str(),
                rec.amount_range,
                rec.owner.map(|o| o.as_str()),
                rec.comment,
                rec.source_url,
                result.source_format,
                result.confidence,
            ])?;
            if inserted == 0 {
                skipped += 1;
            } else {
                new += 1;
            }
        }
    }
    tx.commit()?;

    let status = if anomalies.is_empty() {
        BatchStatus::Success
    } else {
        BatchStatus::Partial
    };
    db::log_extraction(
        conn,
        &LogEntry {
            source_type: result.source_format.clone(),
            source_url: source_url.to_string(),
            confidence: Some(result.confidence),
            raw_record_count: Some(result.raw_record_count as i64),
            extracted_count: Some(result.records.len() as i64),
            status,
            error_message: if anomalies.is_empty() {
                None
            } else {
                Some(anomalies.join("; "))
            },
        },
    )?;

    info!(
        "Loaded {} ({} new, {} skipped, {})",
        source_url,
        new,
        skipped,
        status.as_str()
    );
    Ok(LoadOutcome {
        new,
        skipped,
        status,
    })
}

/// Date checks run after the transformer's correction pass. Violations are
/// recorded and flip the batch to `partial`, but never block the insert.
fn check_dates(rec: &TradeRecord, today: NaiveDate) -> Vec<String> {
    let mut violations = Vec::new();
    if rec.transaction_date > today {
        violations.push(format!(
            "transaction_date {} is in the future",
            rec.transaction_date
        ));
    }
    if rec.filing_date > today {
        violations.push(format!("filing_date {} is in the future", rec.filing_date));
    }
    if rec.transaction_date > rec.filing_date + Duration::days(60) {
        violations.push(format!(
            "transaction_date {} is more than 60 days after filing_date {}",
            rec.transaction_date, rec.filing_date
        ));
    }
    violations
}

/// Direct load for the insider path. The XML source is machine-readable, so
/// records arrive already structured and fully trusted.
pub fn load_insiders(conn: &Connection, trades: &[InsiderTrade]) -> Result<LoadOutcome> {
    let mut new = 0usize;
    let mut skipped = 0usize;

    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO insider_trades
             (dedup_hash, insider_name, insider_relationship, issuer_name, ticker,
              transaction_date, transaction_code, shares, price_per_share,
              ownership_kind, is_derivative, accession_no, filing_date, source_url)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        )?;
        for t in trades {
            let inserted = stmt.execute(rusqlite::params![
                t.dedup_hash(),
                t.insider_name,
                t.insider_relationship,
                t.issuer_name,
                t.ticker,
                t.transaction_date.to_string(),
                t.transaction_code,
                t.shares,
                t.price_per_share,
                t.ownership_kind.as_str(),
                t.is_derivative,
                t.accession_no,
                t.filing_date.to_string(),
                t.source_url,
            ])?;
            if inserted == 0 {
                skipped += 1;
            } else {
                new += 1;
            }
        }
    }
    tx.commit()?;

    if let Some(first) = trades.first() {
        db::log_extraction(
            conn,
            &LogEntry {
                source_type: "insider-xml".into(),
                source_url: first.source_url.clone(),
                confidence: None,
                raw_record_count: Some(trades.len() as i64),
                extracted_count: Some(trades.len() as i64),
                status: BatchStatus::Success,
                error_message: None,
            },
        )?;
    }

    Ok(LoadOutcome {
        new,
        skipped,
        status: BatchStatus::Success,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chamber, OwnerKind, TransactionType};

    fn mem() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    fn smith_buy() -> TradeRecord {
        TradeRecord {
            politician_name: "A. Smith".into(),
            chamber: Chamber::Senate,
            transaction_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            filing_date: NaiveDate::from_ymd_opt(2025, 1, 20).unwrap(),
            ticker: Some("AAPL".into()),
            asset_name: "Apple Inc.".into(),
            asset_type: "Stock".into(),
            transaction_type: TransactionType::Buy,
            amount_range: "$15,001 - $50,000".into(),
            owner: Some(OwnerKind::Principal),
            comment: None,
            source_url: "u1".into(),
        }
    }

    fn batch(records: Vec<TradeRecord>, confidence: f64) -> ExtractionResult {
        let n = records.len();
        ExtractionResult {
            records,
            source_format: "senate_html".into(),
            confidence,
            raw_record_count: n,
        }
    }

    fn trade_count(conn: &Connection) -> usize {
        conn.query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn first_load_then_replay() {
        let conn = mem();
        let cfg = LoadConfig::default();
        let result = batch(vec![smith_buy()], 0.95);

        let first = load(&conn, &result, "u1", &cfg).unwrap();
        assert_eq!(first.new, 1);
        assert_eq!(first.skipped, 0);
        assert_eq!(first.status, BatchStatus::Success);

        let second = load(&conn, &result, "u1", &cfg).unwrap();
        assert_eq!(second.new, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.status, BatchStatus::Success);
        assert_eq!(trade_count(&conn), 1);
    }

    #[test]
    fn confidence_gate_withholds_everything() {
        let conn = mem();
        let cfg = LoadConfig::default();
        let result = batch(vec![smith_buy()], 0.4);

        let outcome = load(&conn, &result, "u1", &cfg).unwrap();
        assert_eq!(outcome.new, 0);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.status, BatchStatus::ManualReview);
        assert_eq!(trade_count(&conn), 0);

        let log = db::fetch_log(&conn, 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "manual_review");
    }

    #[test]
    fn gate_applies_regardless_of_record_count() {
        let conn = mem();
        let cfg = LoadConfig::default();
        let mut other = smith_buy();
        other.ticker = Some("MSFT".into());
        let result = batch(vec![smith_buy(), other], 0.2);

        let outcome = load(&conn, &result, "u1", &cfg).unwrap();
        assert_eq!(outcome.skipped, 2);
        assert_eq!(trade_count(&conn), 0);
        assert_eq!(db::fetch_log(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn records_differing_in_cosmetics_collapse() {
        let conn = mem();
        let cfg = LoadConfig::default();
        let mut renamed = smith_buy();
        renamed.asset_name = "Apple Incorporated".into();
        renamed.comment = Some("amended".into());

        let outcome = load(&conn, &batch(vec![smith_buy(), renamed], 0.9), "u1", &cfg).unwrap();
        assert_eq!(outcome.new, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(trade_count(&conn), 1);
    }

    #[test]
    fn identity_field_change_makes_second_row() {
        let conn = mem();
        let cfg = LoadConfig::default();
        let mut sale = smith_buy();
        sale.transaction_type = TransactionType::Sale;

        let outcome = load(&conn, &batch(vec![smith_buy(), sale], 0.9), "u1", &cfg).unwrap();
        assert_eq!(outcome.new, 2);
        assert_eq!(trade_count(&conn), 2);
    }

    #[test]
    fn future_date_flags_partial_but_still_loads() {
        let conn = mem();
        let cfg = LoadConfig::default();
        let mut rec = smith_buy();
        rec.transaction_date = Utc::now().date_naive() + Duration::days(30);

        let outcome = load(&conn, &batch(vec![rec], 0.9), "u1", &cfg).unwrap();
        assert_eq!(outcome.new, 1);
        assert_eq!(outcome.status, BatchStatus::Partial);
        let log = db::fetch_log(&conn, 1).unwrap();
        assert_eq!(log[0].status, "partial");
        assert!(log[0].error_message.as_deref().unwrap().contains("future"));
    }

    #[test]
    fn insider_load_is_idempotent() {
        let conn = mem();
        let t = InsiderTrade {
            insider_name: "DOE JANE".into(),
            insider_relationship: "Chief Financial Officer".into(),
            issuer_name: "Acme Corp".into(),
            ticker: "ACME".into(),
            transaction_date: NaiveDate::from_ymd_opt(2025, 2, 3).unwrap(),
            transaction_code: "P".into(),
            shares: 1500.0,
            price_per_share: Some(12.5),
            ownership_kind: crate::model::OwnershipKind::Direct,
            is_derivative: false,
            accession_no: "0001234567-25-000123".into(),
            filing_date: NaiveDate::from_ymd_opt(2025, 2, 4).unwrap(),
            source_url: "https://www.sec.gov/Archives/edgar/data/1234567/000123456725000123/form4.xml".into(),
        };
        let first = load_insiders(&conn, std::slice::from_ref(&t)).unwrap();
        assert_eq!(first.new, 1);
        let second = load_insiders(&conn, std::slice::from_ref(&t)).unwrap();
        assert_eq!(second.new, 0);
        assert_eq!(second.skipped, 1);
    }
}
