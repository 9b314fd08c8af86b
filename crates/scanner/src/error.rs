use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a scanner.
///
/// None of these say anything about the scanned content; an infected object
/// is a successful scan with an infected [`ScanVerdict`](crate::ScanVerdict).
#[derive(Debug, Error)]
pub enum ScanError {
    /// The scanner could not be reached after all connection attempts.
    #[error("scanner unavailable: {0}")]
    Unavailable(String),

    /// A network or transport-level error occurred mid-scan.
    #[error("scanner i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The scanner did not reply within the allowed duration.
    #[error("scanner timeout after {0:?}")]
    Timeout(Duration),

    /// The scanner replied with an error or something unparseable.
    #[error("scanner protocol error: {0}")]
    Protocol(String),
}

impl ScanError {
    /// Returns `true` if the error is transient and a later attempt may
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ScanError::Unavailable("refused".into()).is_retryable());
        assert!(ScanError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(
            ScanError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_retryable()
        );
    }

    #[test]
    fn protocol_errors_are_not_retryable() {
        let err = ScanError::Protocol("INSTREAM size limit exceeded. ERROR".into());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("size limit"));
    }
}
