mod db;
mod error;
mod extract;
mod fetch;
mod llm;
mod load;
mod model;
mod pipeline;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use extract::Transformer;
use llm::LlmClient;
use fetch::{
    edgar::EdgarClient, house::HouseSource, mirror::MirrorSource, senate::SenateSource, DateWindow,
    Source,
};
use load::LoadConfig;
use pipeline::RunStats;

const DEFAULT_DB_PATH: &str = "data/disclosures.sqlite";
const DEFAULT_WINDOW_DAYS: i64 = 30;
const DEFAULT_MAX_FILINGS: usize = 50;
const DEFAULT_MIRROR_PAGES: usize = 5;

#[derive(Parser)]
#[command(
    name = "disclosure_etl",
    about = "Congressional and insider trading disclosure ETL"
)]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, default_value = DEFAULT_DB_PATH)]
    db: String,
    /// Confidence below which extraction batches are held for manual review
    #[arg(long, global = true, default_value_t = 0.7)]
    threshold: f64,
    /// Model attempts per document before the document is discarded
    #[arg(long, global = true, default_value_t = extract::DEFAULT_MAX_RETRIES)]
    max_retries: u32,
    /// Generative model name (client default when omitted)
    #[arg(long, global = true)]
    model: Option<String>,
    /// Concurrent transform workers
    #[arg(long, global = true, default_value_t = pipeline::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every source family for a date window
    Run {
        /// Window start (YYYY-MM-DD, default: 30 days back)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Window end (YYYY-MM-DD, default: today)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Issuer tickers for the insider family (skipped when empty)
        #[arg(long = "ticker")]
        tickers: Vec<String>,
    },
    /// Ingest congressional disclosures only
    Congress {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Ingest insider Form 4 filings only
    Insiders {
        /// Issuer tickers to query
        #[arg(required = true)]
        tickers: Vec<String>,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Show store statistics
    Stats,
    /// Recent trades table
    Trades {
        /// Filter by politician name (substring)
        #[arg(short, long)]
        politician: Option<String>,
        /// Filter by ticker
        #[arg(short, long)]
        ticker: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Tail the extraction log
    Log {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let conn = db::connect(&cli.db)?;
    db::init_schema(&conn)?;

    let result = match &cli.command {
        Commands::Run { from, to, tickers } => {
            let window = window(*from, *to);
            let mut stats = run_congress(&conn, &cli, &window).await?;
            if tickers.is_empty() {
                println!("No --ticker given, skipping insider filings.");
            } else {
                let edgar = EdgarClient::new()?;
                stats.merge(pipeline::run_insiders(&conn, &edgar, tickers, &window).await?);
            }
            stats.print();
            Ok(())
        }
        Commands::Congress { from, to } => {
            let window = window(*from, *to);
            let stats = run_congress(&conn, &cli, &window).await?;
            stats.print();
            Ok(())
        }
        Commands::Insiders { tickers, from, to } => {
            let window = window(*from, *to);
            let edgar = EdgarClient::new()?;
            let stats = pipeline::run_insiders(&conn, &edgar, tickers, &window).await?;
            stats.print();
            Ok(())
        }
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            println!("Trades:         {}", s.trades);
            println!("Insider trades: {}", s.insider_trades);
            println!("Politicians:    {}", s.politicians);
            println!("Log success:    {}", s.log_success);
            println!("Log partial:    {}", s.log_partial);
            println!("Manual review:  {}", s.log_manual_review);
            println!("Log failed:     {}", s.log_failed);
            Ok(())
        }
        Commands::Trades {
            politician,
            ticker,
            limit,
        } => {
            let rows = db::fetch_trades(&conn, politician.as_deref(), ticker.as_deref(), *limit)?;
            if rows.is_empty() {
                println!("No trades found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<24} | {:<7} | {:<10} | {:<6} | {:<8} | {:<22} | {:<11}",
                "#", "Politician", "Chamber", "Traded", "Ticker", "Type", "Amount", "Source"
            );
            println!("{}", "-".repeat(108));
            for (i, r) in rows.iter().enumerate() {
                println!(
                    "{:>3} | {:<24} | {:<7} | {:<10} | {:<6} | {:<8} | {:<22} | {:<11}",
                    i + 1,
                    truncate(&r.politician_name, 24),
                    r.chamber,
                    r.transaction_date,
                    r.ticker.as_deref().unwrap_or("-"),
                    r.transaction_type,
                    truncate(&r.amount_range, 22),
                    r.source_format,
                );
            }
            println!("\n{} trades", rows.len());
            Ok(())
        }
        Commands::Log { limit } => {
            let rows = db::fetch_log(&conn, *limit)?;
            if rows.is_empty() {
                println!("Extraction log is empty.");
                return Ok(());
            }
            for r in &rows {
                let conf = r
                    .confidence
                    .map(|c| format!("{:.2}", c))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{} [{}] conf={} n={} {} {}",
                    r.created_at,
                    r.status,
                    conf,
                    r.extracted_count.unwrap_or(0),
                    truncate(&r.source_url, 60),
                    r.error_message.as_deref().unwrap_or(""),
                );
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn window(from: Option<NaiveDate>, to: Option<NaiveDate>) -> DateWindow {
    let to = to.unwrap_or_else(|| Utc::now().date_naive());
    let from = from.unwrap_or(to - Duration::days(DEFAULT_WINDOW_DAYS));
    DateWindow { from, to }
}

/// Both congressional families: Senate (with the mirror as fallback) and
/// House PDFs. A source that cannot be constructed (missing API key) drops
/// out of its chain with a warning instead of failing the run.
async fn run_congress(
    conn: &rusqlite::Connection,
    cli: &Cli,
    window: &DateWindow,
) -> Result<RunStats> {
    let llm = Arc::new(llm::AnthropicClient::from_env(cli.model.clone())?);
    info!("Extracting with model {}", llm.model_name());
    let transformer = Arc::new(Transformer::new(llm, cli.max_retries));
    let load_cfg = LoadConfig {
        confidence_threshold: cli.threshold,
    };

    let mut senate_chain: Vec<Box<dyn Source>> = Vec::new();
    match SenateSource::from_env(DEFAULT_MAX_FILINGS) {
        Ok(s) => senate_chain.push(Box::new(s)),
        Err(e) => warn!("Senate source unavailable: {}", e),
    }
    match MirrorSource::new(DEFAULT_MIRROR_PAGES) {
        Ok(m) => senate_chain.push(Box::new(m)),
        Err(e) => warn!("Mirror source unavailable: {}", e),
    }

    let mut stats = pipeline::run_chain(
        conn,
        &senate_chain,
        &transformer,
        &load_cfg,
        window,
        cli.concurrency,
    )
    .await?;

    let mut house_chain: Vec<Box<dyn Source>> = Vec::new();
    match HouseSource::new(DEFAULT_MAX_FILINGS) {
        Ok(h) => house_chain.push(Box::new(h)),
        Err(e) => warn!("House source unavailable: {}", e),
    }
    stats.merge(
        pipeline::run_chain(
            conn,
            &house_chain,
            &transformer,
            &load_cfg,
            window,
            cli.concurrency,
        )
        .await?,
    );

    Ok(stats)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
