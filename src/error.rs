//! Error types for geodex-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Dataset statistics aggregation failed; surfaced to every waiter.
    #[error("Statistics unavailable: {0}")]
    StatsUnavailable(String),

    /// The thumbnail cannot satisfy the request. This is a fallback signal
    /// for the router, not a user-visible failure.
    #[error("Thumbnail insufficient: {0}")]
    ThumbnailInsufficient(String),

    /// A remote dataset-service operation failed.
    #[error("Remote fetch failed: {0}")]
    RemoteFetch(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed query input (bad envelope, bad quad-key, ...)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON decoding error (opaque partition payloads in the memory service)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The caller closed the stream before exhaustion.
    #[error("Query cancelled")]
    Cancelled,

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a statistics-unavailable error
    pub fn stats_unavailable(msg: impl Into<String>) -> Self {
        Error::StatsUnavailable(msg.into())
    }

    /// Create a thumbnail-insufficient signal
    pub fn thumbnail_insufficient(msg: impl Into<String>) -> Self {
        Error::ThumbnailInsufficient(msg.into())
    }

    /// Create a remote-fetch error
    pub fn remote_fetch(msg: impl Into<String>) -> Self {
        Error::RemoteFetch(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an invalid-query error
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Error::InvalidQuery(msg.into())
    }

    /// Create a cache error
    pub fn cache(msg: impl Into<String>) -> Self {
        Error::Cache(msg.into())
    }

    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True if this is the thumbnail fallback signal rather than a failure.
    pub fn is_thumbnail_insufficient(&self) -> bool {
        matches!(self, Error::ThumbnailInsufficient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_signal_predicate() {
        let err = Error::thumbnail_insufficient("3 rows < 1000 requested");
        assert!(err.is_thumbnail_insufficient());
        assert!(!Error::remote_fetch("boom").is_thumbnail_insufficient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::stats_unavailable("aggregation failed");
        assert_eq!(err.to_string(), "Statistics unavailable: aggregation failed");
    }
}
