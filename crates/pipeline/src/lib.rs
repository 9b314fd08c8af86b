//! The upload and scan pipeline.
//!
//! Uploads are validated against an [`UploadPolicy`], stored with tenant
//! metadata, and announced as upload-scan events. The [`ScanProcessor`]
//! consumes those events: it records the file, streams the object through
//! the scanner, and either quarantines it or marks it clean and meters its
//! storage. [`QueueConsumer`] drives any [`MessageHandler`] from a broker
//! queue, including the [`NotificationIngestor`] for bucket notifications.

pub mod consumer;
pub mod error;
pub mod handler;
pub mod notification;
pub mod policy;
pub mod processor;
pub mod upload;
pub mod work_queue;

pub use consumer::{ConsumerConfig, QueueConsumer};
pub use error::PipelineError;
pub use handler::{Disposition, MessageHandler, dispatch};
pub use notification::{
    BucketNotification, CreatedObject, NOTIFICATION_QUEUE, NotificationIngestor,
    notification_binding,
};
pub use policy::{UploadPolicy, UploadRequest};
pub use processor::{ScanOutcome, ScanProcessor};
pub use upload::{UploadService, UploadTarget};
pub use work_queue::WorkQueue;
