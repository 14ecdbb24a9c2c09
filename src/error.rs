use thiserror::Error;

/// Result type for fetcher operations.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors that can occur while scheduling and servicing fetches.
#[derive(Debug, Error)]
pub enum FetchError {
    /// URL failed to parse (request construction, redirect target, proxy)
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Only http and https targets can be serviced
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Transport-level failure (DNS, connect, timeout, TLS)
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Redirect chain exceeded the request's limit
    #[error("Redirect limit of {0} exceeded")]
    TooManyRedirects(u32),

    /// The user preempted the transfer from inside a hook
    #[error("Transfer preempted: {0}")]
    Preempted(String),

    /// Backing queue store failed
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization of a queued request failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FetchError {
    /// True for the distinguished user-preemption failure raised via
    /// [`preempt`](crate::request::preempt).
    pub fn is_preemption(&self) -> bool {
        matches!(self, FetchError::Preempted(_))
    }
}
