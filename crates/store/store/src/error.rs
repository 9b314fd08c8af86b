use thiserror::Error;

/// Errors from store, transaction and lock operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("lock expired: {0}")]
    LockExpired(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StoreError::Connection("reset".into()).is_retryable());
        assert!(StoreError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!StoreError::UniqueViolation("dup".into()).is_retryable());
        assert!(!StoreError::not_found("file", "1").is_retryable());
    }

    #[test]
    fn not_found_display() {
        assert_eq!(
            StoreError::not_found("file", "abc").to_string(),
            "file not found: abc"
        );
    }
}
