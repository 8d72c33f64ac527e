use anyhow::Result;
use rusqlite::Connection;

/// Outcome class of one transform+load attempt, persisted in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Success,
    Partial,
    ManualReview,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Partial => "partial",
            BatchStatus::ManualReview => "manual_review",
            BatchStatus::Failed => "failed",
        }
    }
}

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = std::path::Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS trades (
            id                    INTEGER PRIMARY KEY,
            dedup_hash            TEXT UNIQUE NOT NULL,
            politician_name       TEXT NOT NULL,
            chamber               TEXT NOT NULL CHECK(chamber IN ('Senate','House')),
            transaction_date      TEXT NOT NULL,
            filing_date           TEXT NOT NULL,
            ticker                TEXT,
            asset_name            TEXT NOT NULL,
            asset_type            TEXT NOT NULL DEFAULT 'Stock',
            transaction_type      TEXT NOT NULL CHECK(transaction_type IN ('Buy','Sale','Exchange')),
            amount_range          TEXT NOT NULL,
            owner                 TEXT CHECK(owner IN ('Self','Spouse','Child','Joint')),
            comment               TEXT,
            source_url            TEXT NOT NULL,
            source_format         TEXT NOT NULL,
            extraction_confidence REAL NOT NULL,
            created_at            TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_trades_politician ON trades(politician_name);
        CREATE INDEX IF NOT EXISTS idx_trades_ticker ON trades(ticker);
        CREATE INDEX IF NOT EXISTS idx_trades_tx_date ON trades(transaction_date);

        CREATE TABLE IF NOT EXISTS insider_trades (
            id                   INTEGER PRIMARY KEY,
            dedup_hash           TEXT UNIQUE NOT NULL,
            insider_name         TEXT NOT NULL,
            insider_relationship TEXT NOT NULL,
            issuer_name          TEXT NOT NULL,
            ticker               TEXT NOT NULL,
            transaction_date     TEXT NOT NULL,
            transaction_code     TEXT NOT NULL,
            shares               REAL NOT NULL,
            price_per_share      REAL,
            ownership_kind       TEXT NOT NULL CHECK(ownership_kind IN ('Direct','Indirect')),
            is_derivative        BOOLEAN NOT NULL DEFAULT 0,
            accession_no         TEXT NOT NULL,
            filing_date          TEXT NOT NULL,
            source_url           TEXT NOT NULL,
            created_at           TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_insider_ticker ON insider_trades(ticker);
        CREATE INDEX IF NOT EXISTS idx_insider_tx_date ON insider_trades(transaction_date);

        -- Append-only audit trail: one row per transform+load attempt.
        CREATE TABLE IF NOT EXISTS extraction_log (
            id               INTEGER PRIMARY KEY,
            source_type      TEXT NOT NULL,
            source_url       TEXT NOT NULL,
            confidence       REAL,
            raw_record_count INTEGER,
            extracted_count  INTEGER,
            status           TEXT NOT NULL CHECK(status IN ('success','partial','manual_review','failed')),
            error_message    TEXT,
            created_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_log_status ON extraction_log(status);
        ",
    )?;
    Ok(())
}

// ── Extraction log ──

pub struct LogEntry {
    pub source_type: String,
    pub source_url: String,
    pub confidence: Option<f64>,
    pub raw_record_count: Option<i64>,
    pub extracted_count: Option<i64>,
    pub status: BatchStatus,
    pub error_message: Option<String>,
}

pub fn log_extraction(conn: &Connection, entry: &LogEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO extraction_log
         (source_type, source_url, confidence, raw_record_count, extracted_count, status, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            entry.source_type,
            entry.source_url,
            entry.confidence,
            entry.raw_record_count,
            entry.extracted_count,
            entry.status.as_str(),
            entry.error_message,
        ],
    )?;
    Ok(())
}

pub struct LogRow {
    pub source_type: String,
    pub source_url: String,
    pub confidence: Option<f64>,
    pub extracted_count: Option<i64>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: String,
}

pub fn fetch_log(conn: &Connection, limit: usize) -> Result<Vec<LogRow>> {
    let mut stmt = conn.prepare(
        "SELECT source_type, source_url, confidence, extracted_count, status, error_message, created_at
         FROM extraction_log ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit], |row| {
            Ok(LogRow {
                source_type: row.get(0)?,
                source_url: row.get(1)?,
                confidence: row.get(2)?,
                extracted_count: row.get(3)?,
                status: row.get(4)?,
                error_message: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Trade views ──

pub struct TradeView {
    pub politician_name: String,
    pub chamber: String,
    pub transaction_date: String,
    pub filing_date: String,
    pub ticker: Option<String>,
    pub transaction_type: String,
    pub amount_range: String,
    pub source_format: String,
}

pub fn fetch_trades(
    conn: &Connection,
    politician: Option<&str>,
    ticker: Option<&str>,
    limit: usize,
) -> Result<Vec<TradeView>> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(p) = politician {
        conditions.push(format!("politician_name LIKE ?{}", params.len() + 1));
        params.push(Box::new(format!("%{}%", p)));
    }
    if let Some(t) = ticker {
        conditions.push(format!("ticker = ?{}", params.len() + 1));
        params.push(Box::new(t.to_uppercase()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT politician_name, chamber, transaction_date, filing_date,
                ticker, transaction_type, amount_range, source_format
         FROM trades{}
         ORDER BY transaction_date DESC
         LIMIT {}",
        where_clause, limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(TradeView {
                politician_name: row.get(0)?,
                chamber: row.get(1)?,
                transaction_date: row.get(2)?,
                filing_date: row.get(3)?,
                ticker: row.get(4)?,
                transaction_type: row.get(5)?,
                amount_range: row.get(6)?,
                source_format: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub trades: usize,
    pub insider_trades: usize,
    pub politicians: usize,
    pub log_success: usize,
    pub log_partial: usize,
    pub log_manual_review: usize,
    pub log_failed: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let trades: usize = conn.query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))?;
    let insider_trades: usize =
        conn.query_row("SELECT COUNT(*) FROM insider_trades", [], |r| r.get(0))?;
    let politicians: usize = conn.query_row(
        "SELECT COUNT(DISTINCT politician_name) FROM trades",
        [],
        |r| r.get(0),
    )?;
    let count_status = |status: &str| -> Result<usize> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM extraction_log WHERE status = ?1",
            [status],
            |r| r.get(0),
        )?)
    };
    Ok(Stats {
        trades,
        insider_trades,
        politicians,
        log_success: count_status("success")?,
        log_partial: count_status("partial")?,
        log_manual_review: count_status("manual_review")?,
        log_failed: count_status("failed")?,
    })
}
