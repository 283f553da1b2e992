use thiserror::Error;

/// Error type for query and mutation operations.
///
/// Errors are `Clone` so that one settled fetch can hand the same outcome to
/// every caller that was deduplicated onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Mutation failed: {0}")]
    MutationError(String),

    /// The caller passed a malformed key. Never retried.
    #[error("Invalid query key: {0}")]
    InvalidKey(String),

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Cached data for {0} has a different type")]
    TypeMismatch(String),

    #[error("Query client has been disposed")]
    Disposed,
}

impl QueryError {
    /// Returns `true` if a failed attempt with this error may be retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FetchError(_) | Self::NetworkError(_) | Self::MutationError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display() {
        let err = QueryError::FetchError("test error".to_string());
        assert_eq!(err.to_string(), "Fetch failed: test error");

        let err = QueryError::NetworkError("network error".to_string());
        assert_eq!(err.to_string(), "Network error: network error");

        let err = QueryError::InvalidKey("empty".to_string());
        assert_eq!(err.to_string(), "Invalid query key: empty");
    }

    #[test]
    fn test_retryable() {
        assert!(QueryError::FetchError(String::new()).is_retryable());
        assert!(QueryError::NetworkError(String::new()).is_retryable());
        assert!(!QueryError::InvalidKey(String::new()).is_retryable());
        assert!(!QueryError::Cancelled.is_retryable());
        assert!(!QueryError::Disposed.is_retryable());
    }
}
