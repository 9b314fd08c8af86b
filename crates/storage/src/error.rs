use thiserror::Error;

/// Errors that can occur during object storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested object was not found.
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// The reader side of a streamed download went away.
    #[error("download sink closed")]
    SinkClosed,

    /// The backend could not be reached or throttled the request.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the request.
    #[error("storage error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(StorageError::Unavailable("timeout".into()).is_retryable());
        assert!(!StorageError::not_found("b", "k").is_retryable());
        assert!(!StorageError::SinkClosed.is_retryable());
        assert_eq!(
            StorageError::not_found("uploads", "a.pdf").to_string(),
            "object not found: uploads/a.pdf"
        );
    }
}
