use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::db::{self, BatchStatus, LogEntry};
use crate::extract::Transformer;
use crate::fetch::edgar::EdgarClient;
use crate::fetch::{DateWindow, Source};
use crate::load::{self, LoadConfig};
use crate::model::FetchResult;

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Aggregate outcome of a whole run. The only success signal a caller needs:
/// a non-zero failed count next to a non-zero new count is an ordinary
/// partial success.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub new: usize,
    pub skipped: usize,
    pub failed: usize,
    pub sources_processed: usize,
}

impl RunStats {
    pub fn merge(&mut self, other: RunStats) {
        self.new += other.new;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.sources_processed += other.sources_processed;
    }

    pub fn print(&self) {
        println!(
            "New: {}  Skipped: {}  Failed: {}  Sources: {}",
            self.new, self.skipped, self.failed, self.sources_processed
        );
    }
}

/// Walk the chain in order until a source yields documents, then transform
/// and load each one. "Try the primary, fall back when it yields nothing" is
/// data here — fetchers and the transformer know nothing about each other.
pub async fn run_chain(
    conn: &Connection,
    chain: &[Box<dyn Source>],
    transformer: &Arc<Transformer>,
    load_cfg: &LoadConfig,
    window: &DateWindow,
    concurrency: usize,
) -> Result<RunStats> {
    let mut docs: Vec<FetchResult> = Vec::new();
    let mut producer = None;

    for source in chain {
        match source.fetch(window).await {
            Ok(results) if !results.is_empty() => {
                info!("{} produced {} documents", source.name(), results.len());
                docs = results;
                producer = Some(source.name());
                break;
            }
            Ok(_) => info!("{} yielded nothing, trying next source", source.name()),
            Err(e) => warn!("{} failed ({}), trying next source", source.name(), e),
        }
    }

    if producer.is_none() {
        info!("No source in the chain produced documents");
        return Ok(RunStats::default());
    }

    let mut stats = process_documents(conn, docs, transformer, load_cfg, concurrency).await?;
    stats.sources_processed = 1;
    Ok(stats)
}

/// Transform documents under a bounded worker pool; load results one at a
/// time as they arrive. Per-document failures are counted and logged, never
/// propagated to siblings.
async fn process_documents(
    conn: &Connection,
    docs: Vec<FetchResult>,
    transformer: &Arc<Transformer>,
    load_cfg: &LoadConfig,
    concurrency: usize,
) -> Result<RunStats> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let total = docs.len();

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel(concurrency.max(1) * 2);

    for doc in docs {
        let transformer = Arc::clone(transformer);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let _permit = sem.acquire().await.unwrap();
            let outcome = transformer.transform(&doc).await;
            let _ = tx.send((doc, outcome)).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let mut stats = RunStats::default();
    while let Some((doc, outcome)) = rx.recv().await {
        match outcome {
            Ok(result) => match load::load(conn, &result, &doc.source_url, load_cfg) {
                Ok(o) => {
                    stats.new += o.new;
                    stats.skipped += o.skipped;
                }
                Err(e) => {
                    warn!("Load failed for {}: {}", doc.source_url, e);
                    stats.failed += 1;
                }
            },
            Err(e) => {
                warn!("Transform failed for {}: {}", doc.source_url, e);
                db::log_extraction(
                    conn,
                    &LogEntry {
                        source_type: doc.source_kind.as_str().to_string(),
                        source_url: doc.source_url.clone(),
                        confidence: None,
                        raw_record_count: None,
                        extracted_count: None,
                        status: BatchStatus::Failed,
                        error_message: Some(e.to_string()),
                    },
                )?;
                stats.failed += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Processed {} documents ({} new, {} skipped, {} failed)",
        total, stats.new, stats.skipped, stats.failed
    );
    Ok(stats)
}

/// The insider family: already-structured records go straight to the store.
pub async fn run_insiders(
    conn: &Connection,
    edgar: &EdgarClient,
    tickers: &[String],
    window: &DateWindow,
) -> Result<RunStats> {
    match edgar.fetch_form4(tickers, window).await {
        Ok(trades) if trades.is_empty() => {
            info!("No insider filings in the window");
            Ok(RunStats {
                sources_processed: 1,
                ..RunStats::default()
            })
        }
        Ok(trades) => {
            let outcome = load::load_insiders(conn, &trades)?;
            Ok(RunStats {
                new: outcome.new,
                skipped: outcome.skipped,
                failed: 0,
                sources_processed: 1,
            })
        }
        Err(e) => {
            warn!("Insider fetch failed: {}", e);
            db::log_extraction(
                conn,
                &LogEntry {
                    source_type: "insider-xml".to_string(),
                    source_url: String::new(),
                    confidence: None,
                    raw_record_count: None,
                    extracted_count: None,
                    status: BatchStatus::Failed,
                    error_message: Some(e.to_string()),
                },
            )?;
            Ok(RunStats {
                failed: 1,
                ..RunStats::default()
            })
        }
    }
}
