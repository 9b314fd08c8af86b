use thiserror::Error;

use tenantry_broker::BrokerError;
use tenantry_core::{CoreError, ScanStatus};
use tenantry_metering::MeteringError;
use tenantry_scanner::ScanError;
use tenantry_storage::StorageError;
use tenantry_tenancy::GuardError;

/// Errors raised by the upload path and the scan consumer.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The upload request violates the [`UploadPolicy`](crate::UploadPolicy).
    #[error("upload rejected: {0}")]
    UploadRejected(String),

    /// The object was stored but its scan event could not be published.
    /// The caller must treat the upload as failed and may retry it.
    #[error("upload of {object_key} is incomplete: scan event not published")]
    Incomplete {
        object_key: String,
        #[source]
        source: BrokerError,
    },

    /// Downloads are only offered for files that scanned clean.
    #[error("file is not available for download: {0}")]
    NotDownloadable(ScanStatus),

    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A message that no number of redeliveries can process.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The announced object does not exist in storage.
    #[error("object missing: {bucket}/{key}")]
    ObjectMissing { bucket: String, key: String },

    /// The object key is already recorded under another tenant.
    #[error("object key conflict: {0}")]
    KeyConflict(String),

    /// The scanner stopped reading before the whole object was sent and
    /// did not report an infection.
    #[error("scan of {0} ended before the object was fully read")]
    ScanIncomplete(String),

    #[error("work queue closed")]
    QueueClosed,

    #[error("work queue full")]
    QueueFull,

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Metering(#[from] MeteringError),

    #[error(transparent)]
    Domain(#[from] CoreError),
}

impl PipelineError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ScanIncomplete(_) | Self::QueueFull => true,
            Self::Incomplete { source, .. } => source.is_retryable(),
            Self::Guard(e) => e.is_retryable(),
            Self::Storage(e) => e.is_retryable(),
            Self::Broker(e) => e.is_retryable(),
            Self::Scan(e) => e.is_retryable(),
            Self::Metering(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether a message failing with this error must leave the queue
    /// instead of being redelivered.
    pub fn is_poison(&self) -> bool {
        match self {
            Self::Malformed(_)
            | Self::ObjectMissing { .. }
            | Self::KeyConflict(_)
            | Self::Domain(_) => true,
            Self::Guard(e) => {
                e.is_integrity_violation()
                    || matches!(e, GuardError::NoTenantContext | GuardError::Serialization(_))
            }
            Self::Metering(MeteringError::InvalidRecord(_)) => true,
            _ => false,
        }
    }
}
