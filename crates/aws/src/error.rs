use tenantry_broker::BrokerError;
use tenantry_storage::StorageError;
use thiserror::Error;

/// A classified AWS SDK failure.
#[derive(Debug, Error)]
pub enum AwsError {
    #[error("AWS service error: {0}")]
    Service(String),

    #[error("AWS request throttled")]
    Throttled,

    #[error("AWS connection error: {0}")]
    Connection(String),

    #[error("AWS request timed out")]
    Timeout,

    #[error("invalid AWS configuration: {0}")]
    Configuration(String),
}

impl AwsError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled | Self::Connection(_) | Self::Timeout)
    }
}

impl From<AwsError> for StorageError {
    fn from(err: AwsError) -> Self {
        if err.is_retryable() {
            StorageError::Unavailable(err.to_string())
        } else {
            StorageError::Backend(err.to_string())
        }
    }
}

impl From<AwsError> for BrokerError {
    fn from(err: AwsError) -> Self {
        if err.is_retryable() {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Backend(err.to_string())
        }
    }
}

/// Classify a rendered SDK error by the patterns AWS uses for throttling,
/// timeouts and transport failures.
pub fn classify_sdk_error(error_str: &str) -> AwsError {
    let lower = error_str.to_lowercase();
    if lower.contains("throttl")
        || lower.contains("rate exceed")
        || lower.contains("slowdown")
        || lower.contains("too many")
    {
        AwsError::Throttled
    } else if lower.contains("timeout") || lower.contains("timed out") {
        AwsError::Timeout
    } else if lower.contains("dispatch failure")
        || lower.contains("connect")
        || lower.contains("dns")
        || lower.contains("network")
    {
        AwsError::Connection(error_str.to_owned())
    } else {
        AwsError::Service(error_str.to_owned())
    }
}

/// Classify an SDK error using its whole source chain, since the top-level
/// message of an SDK error is only its category.
pub fn classify_error_chain(err: &dyn std::error::Error) -> AwsError {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    classify_sdk_error(&rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(matches!(
            classify_sdk_error("SlowDown: Please reduce your request rate"),
            AwsError::Throttled
        ));
        assert!(matches!(
            classify_sdk_error("request timed out after 30s"),
            AwsError::Timeout
        ));
        assert!(matches!(
            classify_sdk_error("dispatch failure: io error: Connection refused"),
            AwsError::Connection(_)
        ));
        assert!(matches!(
            classify_sdk_error("AccessDenied: Access Denied"),
            AwsError::Service(_)
        ));
    }

    #[test]
    fn chain_is_inspected() {
        #[derive(Debug, Error)]
        #[error("dispatch failure")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"));
        assert!(matches!(classify_error_chain(&err), AwsError::Timeout));
    }

    #[test]
    fn retryable_maps_to_unavailable() {
        let err: StorageError = AwsError::Throttled.into();
        assert!(err.is_retryable());
        let err: StorageError = AwsError::Service("NoSuchBucket".into()).into();
        assert!(matches!(err, StorageError::Backend(_)));
    }

    #[test]
    fn broker_mapping() {
        let err: BrokerError = AwsError::Connection("reset".into()).into();
        assert!(err.is_retryable());
        let err: BrokerError = AwsError::Configuration("no queue url".into()).into();
        assert!(!err.is_retryable());
    }
}
