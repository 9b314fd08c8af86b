use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// No queue is bound for the destination and routing key, so the
    /// message would have been dropped.
    #[error("unroutable message: {destination}/{routing_key}")]
    Unroutable {
        destination: String,
        routing_key: String,
    },

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The broker or subscription was shut down.
    #[error("broker closed")]
    Closed,

    #[error("broker error: {0}")]
    Backend(String),
}

impl BrokerError {
    /// Returns `true` if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(BrokerError::Connection("refused".into()).is_retryable());
        assert!(!BrokerError::Closed.is_retryable());
        assert!(
            !BrokerError::Unroutable {
                destination: "d".into(),
                routing_key: "k".into()
            }
            .is_retryable()
        );
    }
}
