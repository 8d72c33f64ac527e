use std::collections::HashMap;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// Upstream source families. Each variant maps to one fetcher module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    SenateHtml,
    HousePdf,
    MirrorHtml,
    InsiderXml,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::SenateHtml => "senate-html",
            SourceKind::HousePdf => "house-pdf",
            SourceKind::MirrorHtml => "mirror-html",
            SourceKind::InsiderXml => "insider-xml",
        }
    }
}

/// One fetched document: raw payload plus provenance. Produced by a fetcher,
/// consumed by the transformer, never mutated in between.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source_kind: SourceKind,
    pub content: Vec<u8>,
    pub content_type: String,
    pub source_url: String,
    /// Context already known from the listing page: politician_name,
    /// filing_date, chamber, mirror flag.
    pub metadata: HashMap<String, String>,
}

impl FetchResult {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chamber {
    Senate,
    House,
}

impl Chamber {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chamber::Senate => "Senate",
            Chamber::House => "House",
        }
    }

    pub fn parse(s: &str) -> Option<Chamber> {
        match s.trim().to_lowercase().as_str() {
            "senate" => Some(Chamber::Senate),
            "house" => Some(Chamber::House),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Buy,
    Sale,
    Exchange,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "Buy",
            TransactionType::Sale => "Sale",
            TransactionType::Exchange => "Exchange",
        }
    }

    /// Accepts the canonical names plus the aliases the upstream sites use
    /// ("Purchase", "Sale (Full)", transaction code letters).
    pub fn parse(s: &str) -> Option<TransactionType> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "buy" | "purchase" | "p" => Some(TransactionType::Buy),
            "sale" | "sell" | "s" => Some(TransactionType::Sale),
            "exchange" | "e" => Some(TransactionType::Exchange),
            _ => {
                if lower.starts_with("sale") {
                    Some(TransactionType::Sale)
                } else {
                    None
                }
            }
        }
    }
}

/// Who holds the traded asset. "Self" in the filings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Principal,
    Spouse,
    Child,
    Joint,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Principal => "Self",
            OwnerKind::Spouse => "Spouse",
            OwnerKind::Child => "Child",
            OwnerKind::Joint => "Joint",
        }
    }

    pub fn parse(s: &str) -> Option<OwnerKind> {
        match s.trim().to_lowercase().as_str() {
            "self" => Some(OwnerKind::Principal),
            "spouse" | "sp" => Some(OwnerKind::Spouse),
            "child" | "dc" | "dependent child" => Some(OwnerKind::Child),
            "joint" | "jt" => Some(OwnerKind::Joint),
            _ => None,
        }
    }
}

/// One normalized congressional trade. The canonical unit of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub politician_name: String,
    pub chamber: Chamber,
    pub transaction_date: NaiveDate,
    pub filing_date: NaiveDate,
    pub ticker: Option<String>,
    pub asset_name: String,
    pub asset_type: String,
    pub transaction_type: TransactionType,
    pub amount_range: String,
    pub owner: Option<OwnerKind>,
    pub comment: Option<String>,
    pub source_url: String,
}

impl TradeRecord {
    /// Content-derived identity: the stable fingerprint that makes loads
    /// idempotent. Only the five identity fields participate — asset_name,
    /// comment and provenance deliberately do not.
    pub fn dedup_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.politician_name.as_bytes());
        hasher.update(b"|");
        hasher.update(self.transaction_date.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.ticker.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(self.amount_range.as_bytes());
        hasher.update(b"|");
        hasher.update(self.transaction_type.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Transformer output for one document.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub records: Vec<TradeRecord>,
    pub source_format: String,
    /// Self-reported extraction quality in [0, 1]. Gated by the loader.
    pub confidence: f64,
    /// The extractor's own count of records visible in the source. A larger
    /// value than records.len() signals a possible omission.
    pub raw_record_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipKind {
    Direct,
    Indirect,
}

impl OwnershipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipKind::Direct => "Direct",
            OwnershipKind::Indirect => "Indirect",
        }
    }
}

/// One transaction from a Form 4 ownership document. Already machine-readable
/// at the source, so these load without a transform step.
#[derive(Debug, Clone, PartialEq)]
pub struct InsiderTrade {
    pub insider_name: String,
    pub insider_relationship: String,
    pub issuer_name: String,
    pub ticker: String,
    pub transaction_date: NaiveDate,
    pub transaction_code: String,
    pub shares: f64,
    pub price_per_share: Option<f64>,
    pub ownership_kind: OwnershipKind,
    pub is_derivative: bool,
    pub accession_no: String,
    pub filing_date: NaiveDate,
    pub source_url: String,
}

impl InsiderTrade {
    pub fn dedup_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.accession_no.as_bytes());
        hasher.update(b"|");
        hasher.update(self.ticker.as_bytes());
        hasher.update(b"|");
        hasher.update(self.transaction_date.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.transaction_code.as_bytes());
        hasher.update(b"|");
        hasher.update(format!("{}", self.shares).as_bytes());
        hasher.update(b"|");
        hasher.update(if self.is_derivative { b"D" } else { b"N" } as &[u8]);
        hex::encode(hasher.finalize())
    }
}

const TICKER_PLACEHOLDERS: &[&str] = &["", "-", "--", "N/A", "NA", "NONE", "NULL"];

/// Uppercase the ticker and collapse placeholder values to None.
pub fn normalize_ticker(raw: &str) -> Option<String> {
    let cleaned = raw.trim().trim_start_matches('$').to_uppercase();
    if TICKER_PLACEHOLDERS.contains(&cleaned.as_str()) {
        None
    } else {
        Some(cleaned)
    }
}

/// Amount brackets are free text but must carry a currency marker.
pub fn has_currency_marker(amount: &str) -> bool {
    amount.contains('$')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TradeRecord {
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

    #[test]
    fn hash_ignores_non_identity_fields() {
        let a = record();
        let mut b = record();
        b.asset_name = "Apple Incorporated".into();
        b.comment = Some("duplicate filing".into());
        b.source_url = "u2".into();
        assert_eq!(a.dedup_hash(), b.dedup_hash());
    }

    #[test]
    fn hash_sensitive_to_each_identity_field() {
        let base = record();
        let mut by_name = record();
        by_name.politician_name = "B. Smith".into();
        let mut by_date = record();
        by_date.transaction_date = NaiveDate::from_ymd_opt(2025, 1, 11).unwrap();
        let mut by_ticker = record();
        by_ticker.ticker = Some("MSFT".into());
        let mut by_amount = record();
        by_amount.amount_range = "$1,001 - $15,000".into();
        let mut by_type = record();
        by_type.transaction_type = TransactionType::Sale;

        for other in [by_name, by_date, by_ticker, by_amount, by_type] {
            assert_ne!(base.dedup_hash(), other.dedup_hash());
        }
    }

    #[test]
    fn null_ticker_hashes_as_empty() {
        let mut a = record();
        a.ticker = None;
        let mut b = record();
        b.ticker = None;
        assert_eq!(a.dedup_hash(), b.dedup_hash());
        assert_ne!(a.dedup_hash(), record().dedup_hash());
    }

    #[test]
    fn ticker_normalization() {
        assert_eq!(normalize_ticker("aapl"), Some("AAPL".into()));
        assert_eq!(normalize_ticker(" $brk.b "), Some("BRK.B".into()));
        assert_eq!(normalize_ticker("--"), None);
        assert_eq!(normalize_ticker("n/a"), None);
        assert_eq!(normalize_ticker(""), None);
    }

    #[test]
    fn transaction_type_aliases() {
        assert_eq!(TransactionType::parse("Purchase"), Some(TransactionType::Buy));
        assert_eq!(TransactionType::parse("Sale (Full)"), Some(TransactionType::Sale));
        assert_eq!(TransactionType::parse("P"), Some(TransactionType::Buy));
        assert_eq!(TransactionType::parse("gift"), None);
    }

    #[test]
    fn owner_aliases() {
        assert_eq!(OwnerKind::parse("Self"), Some(OwnerKind::Principal));
        assert_eq!(OwnerKind::parse("SP"), Some(OwnerKind::Spouse));
        assert_eq!(OwnerKind::parse("JT"), Some(OwnerKind::Joint));
        assert_eq!(OwnerKind::parse("trust"), None);
    }

    #[test]
    fn currency_marker() {
        assert!(has_currency_marker("$1,001 - $15,000"));
        assert!(!has_currency_marker("1K-15K"));
    }
}
