use thiserror::Error;

use tenantry_store::StoreError;

/// Errors from recording usage and running aggregation jobs.
#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("invalid usage record: {0}")]
    InvalidRecord(String),

    #[error("invalid schedule for {job}: {reason}")]
    InvalidSchedule { job: &'static str, reason: String },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// Shutdown was requested between two statements of a job.
    #[error("job cancelled")]
    Cancelled,

    #[error("{job} failed after {attempts} attempt(s): {source}")]
    JobFailed {
        job: &'static str,
        attempts: u32,
        #[source]
        source: Box<MeteringError>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MeteringError {
    /// Whether the scheduler should try the job again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(_) => true,
            Self::JobFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_are_retried_cancellation_is_not() {
        assert!(MeteringError::from(StoreError::Backend("deadlock".into())).is_retryable());
        assert!(!MeteringError::Cancelled.is_retryable());
        assert!(!MeteringError::UnknownJob("x".into()).is_retryable());
    }

    #[test]
    fn job_failure_names_the_job() {
        let err = MeteringError::JobFailed {
            job: "period-close",
            attempts: 3,
            source: Box::new(StoreError::Timeout(std::time::Duration::from_secs(5)).into()),
        };
        assert!(err.to_string().starts_with("period-close failed after 3 attempt(s)"));
    }
}
