use thiserror::Error;

/// A fetcher failing means "zero results from this source" to the caller;
/// the orchestrator moves on to the next source in the chain.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("blocked by anti-automation defenses: {0}")]
    Blocked(String),
    #[error("listing page did not parse: {0}")]
    Listing(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Network(e.to_string())
    }
}

/// The transformer only fails loudly: after the whole retry budget is spent
/// the document is discarded and the failure logged.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("model output failed validation after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("no extraction strategy for source kind {0}")]
    NoStrategy(&'static str),
}
