use std::sync::LazyLock;

use regex::Regex;

use crate::llm::Attachment;
use crate::model::{FetchResult, SourceKind};

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap());
static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<table[^>]*>.*?</table>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Keeps prompt size bounded for pages with long boilerplate.
const MAX_DOC_CHARS: usize = 60_000;

pub struct Prompt {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

/// One prompt recipe per source kind: contextual grounding fields, the exact
/// output schema, and the normalization rules that source needs.
pub trait PromptStrategy: Sync {
    fn source_format(&self) -> &'static str;

    fn build(&self, doc: &FetchResult) -> Prompt;
}

pub fn strategy_for(kind: SourceKind) -> Option<&'static dyn PromptStrategy> {
    match kind {
        SourceKind::SenateHtml => Some(&SenateHtmlPrompt),
        SourceKind::HousePdf => Some(&HousePdfPrompt),
        SourceKind::MirrorHtml => Some(&MirrorHtmlPrompt),
        // Already machine-readable; never prompted.
        SourceKind::InsiderXml => None,
    }
}

const OUTPUT_SCHEMA: &str = r#"Respond with exactly one JSON object, no prose, no code fences:
{
  "records": [
    {
      "politician_name": "string",
      "chamber": "Senate" or "House",
      "transaction_date": "YYYY-MM-DD",
      "filing_date": "YYYY-MM-DD",
      "ticker": "uppercase symbol" or null,
      "asset_name": "string",
      "asset_type": "Stock" unless clearly a bond, option, or fund,
      "transaction_type": "Buy", "Sale", or "Exchange",
      "amount_range": "dollar bracket exactly as disclosed, e.g. $15,001 - $50,000",
      "owner": "Self", "Spouse", "Child", "Joint", or null,
      "comment": "string" or null
    }
  ],
  "confidence": 0.0 to 1.0, your honest estimate of extraction quality,
  "raw_record_count": integer, the number of transaction rows you can see in the source
}
Use null for a ticker that is missing or shown as a placeholder ("--", "N/A").
Every amount_range must contain a dollar sign."#;

fn context_lines(doc: &FetchResult) -> String {
    let mut lines = Vec::new();
    if let Some(name) = doc.meta("politician_name") {
        lines.push(format!("Filer: {}", name));
    }
    if let Some(date) = doc.meta("filing_date") {
        lines.push(format!("Filing date: {}", date));
    }
    if let Some(chamber) = doc.meta("chamber") {
        lines.push(format!("Chamber: {}", chamber));
    }
    lines.join("\n")
}

// ── Senate periodic transaction reports ──

pub struct SenateHtmlPrompt;

impl PromptStrategy for SenateHtmlPrompt {
    fn source_format(&self) -> &'static str {
        "senate_html"
    }

    fn build(&self, doc: &FetchResult) -> Prompt {
        let body = compact_document(&doc.text());
        let text = format!(
            "The document below is a U.S. Senate periodic transaction report (electronic \
             financial disclosure). Extract every securities transaction it lists.\n\n\
             {context}\n\n{schema}\n\nDOCUMENT:\n{body}",
            context = context_lines(doc),
            schema = OUTPUT_SCHEMA,
            body = body,
        );
        Prompt {
            text,
            attachments: Vec::new(),
        }
    }
}

// ── House PTR filings (scanned PDFs) ──

pub struct HousePdfPrompt;

impl PromptStrategy for HousePdfPrompt {
    fn source_format(&self) -> &'static str {
        "house_pdf"
    }

    fn build(&self, doc: &FetchResult) -> Prompt {
        let text = format!(
            "The attached PDF is a U.S. House of Representatives periodic transaction \
             report. Extract every securities transaction from all of its pages.\n\n\
             {context}\n\n\
             Transaction code column: P means Buy, S means Sale (partial or full), \
             E means Exchange.\n\
             The owner column uses SP for Spouse, DC for Dependent Child, JT for Joint; \
             blank means Self.\n\n{schema}",
            context = context_lines(doc),
            schema = OUTPUT_SCHEMA,
        );
        Prompt {
            text,
            attachments: vec![Attachment {
                media_type: "application/pdf",
                data: doc.content.clone(),
            }],
        }
    }
}

// ── Third-party mirror ──

const MIRROR_BUCKETS: &str = "\
1K-15K      => $1,001 - $15,000\n\
15K-50K     => $15,001 - $50,000\n\
50K-100K    => $50,001 - $100,000\n\
100K-250K   => $100,001 - $250,000\n\
250K-500K   => $250,001 - $500,000\n\
500K-1M     => $500,001 - $1,000,000\n\
1M-5M       => $1,000,001 - $5,000,000\n\
5M-25M      => $5,000,001 - $25,000,000";

pub struct MirrorHtmlPrompt;

impl PromptStrategy for MirrorHtmlPrompt {
    fn source_format(&self) -> &'static str {
        "mirror_html"
    }

    fn build(&self, doc: &FetchResult) -> Prompt {
        let body = compact_document(&doc.text());
        let text = format!(
            "The document below is a page from a public aggregator that mirrors \
             congressional stock trade disclosures. Extract every trade row.\n\n\
             {context}\n\n\
             The mirror abbreviates amount brackets. Convert them to dollar ranges \
             using this table:\n{buckets}\n\n{schema}\n\nDOCUMENT:\n{body}",
            context = context_lines(doc),
            buckets = MIRROR_BUCKETS,
            schema = OUTPUT_SCHEMA,
            body = body,
        );
        Prompt {
            text,
            attachments: Vec::new(),
        }
    }
}

// ── Payload trimming ──

/// Cut an HTML payload down to the transaction table when one is present,
/// otherwise collapse the whole page to line-oriented text. Non-HTML text
/// passes through with blank lines squeezed. Always capped at MAX_DOC_CHARS.
pub fn compact_document(raw: &str) -> String {
    let compact = if raw.contains('<') && TAG_RE.is_match(raw) {
        let cleaned = SCRIPT_RE.replace_all(raw, "");
        let scope = best_table(&cleaned).unwrap_or(&cleaned);
        html_to_lines(scope)
    } else {
        BLANKS_RE.replace_all(raw.trim(), "\n\n").to_string()
    };

    if compact.len() > MAX_DOC_CHARS {
        compact[..floor_char_boundary(&compact, MAX_DOC_CHARS)].to_string()
    } else {
        compact
    }
}

/// The largest <table> subtree, which on disclosure pages is the data table.
fn best_table(html: &str) -> Option<&str> {
    TABLE_RE
        .find_iter(html)
        .max_by_key(|m| m.len())
        .map(|m| m.as_str())
}

fn html_to_lines(html: &str) -> String {
    let with_breaks = html
        .replace("</tr>", "\n")
        .replace("</td>", " | ")
        .replace("</th>", " | ");
    let text = TAG_RE.replace_all(&with_breaks, "");
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn doc(kind: SourceKind, content: &str) -> FetchResult {
        let mut metadata = HashMap::new();
        metadata.insert("politician_name".into(), "A. Smith".into());
        metadata.insert("filing_date".into(), "2025-01-20".into());
        metadata.insert("chamber".into(), "Senate".into());
        FetchResult {
            source_kind: kind,
            content: content.as_bytes().to_vec(),
            content_type: "text/html".into(),
            source_url: "u".into(),
            metadata,
        }
    }

    #[test]
    fn strategies_cover_prompted_sources() {
        assert!(strategy_for(SourceKind::SenateHtml).is_some());
        assert!(strategy_for(SourceKind::HousePdf).is_some());
        assert!(strategy_for(SourceKind::MirrorHtml).is_some());
        assert!(strategy_for(SourceKind::InsiderXml).is_none());
    }

    #[test]
    fn senate_prompt_grounds_on_metadata() {
        let p = SenateHtmlPrompt.build(&doc(SourceKind::SenateHtml, "<p>body</p>"));
        assert!(p.text.contains("Filer: A. Smith"));
        assert!(p.text.contains("Filing date: 2025-01-20"));
        assert!(p.attachments.is_empty());
    }

    #[test]
    fn mirror_prompt_carries_bucket_table() {
        let p = MirrorHtmlPrompt.build(&doc(SourceKind::MirrorHtml, "rows"));
        assert!(p.text.contains("$1,001 - $15,000"));
        assert!(p.text.contains("$5,000,001 - $25,000,000"));
    }

    #[test]
    fn pdf_prompt_attaches_bytes() {
        let p = HousePdfPrompt.build(&doc(SourceKind::HousePdf, "%PDF-1.4 fake"));
        assert_eq!(p.attachments.len(), 1);
        assert_eq!(p.attachments[0].media_type, "application/pdf");
        assert!(p.text.contains("P means Buy"));
    }

    #[test]
    fn compact_prefers_the_largest_table() {
        let html = "<html><script>junk()</script><table><tr><td>small</td></tr></table>\
                    <table><tr><th>Ticker</th><th>Amount</th></tr>\
                    <tr><td>AAPL</td><td>$15,001 - $50,000</td></tr>\
                    <tr><td>MSFT</td><td>$1,001 - $15,000</td></tr></table></html>";
        let out = compact_document(html);
        assert!(out.contains("AAPL | $15,001 - $50,000 |"));
        assert!(!out.contains("junk"));
        assert!(!out.contains("small"));
    }

    #[test]
    fn compact_passes_plain_text_through() {
        let out = compact_document("line one\n\n\n\nline two");
        assert_eq!(out, "line one\n\nline two");
    }
}
