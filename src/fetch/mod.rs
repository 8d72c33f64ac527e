pub mod edgar;
pub mod house;
pub mod mirror;
pub mod senate;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};

use crate::error::FetchError;
use crate::model::FetchResult;

/// Inclusive date range a fetch run covers.
#[derive(Debug, Clone, Copy)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn last_days(days: i64) -> Self {
        let to = Utc::now().date_naive();
        Self {
            from: to - Duration::days(days),
            to,
        }
    }
}

/// The whole fetcher contract. An Err means "zero results from this source";
/// the orchestrator falls through to the next source in the chain.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, window: &DateWindow) -> Result<Vec<FetchResult>, FetchError>;
}

/// Delay between successive page loads against the same site.
pub(crate) const PAGE_DELAY_MS: u64 = 1500;
