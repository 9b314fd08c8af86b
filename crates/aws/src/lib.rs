//! AWS backends for tenantry.
//!
//! - **S3** (`s3` feature): [`S3ObjectStore`] implements
//!   [`tenantry_storage::ObjectStore`] with presigning and streamed reads.
//! - **SQS** (`sqs` feature): [`SqsBroker`] implements the
//!   [`tenantry_broker`] publisher and consumer traits over SQS queues.
//!
//! Both share [`AwsBaseConfig`](config::AwsBaseConfig) for region, endpoint
//! override, and optional STS assume-role credentials.

pub mod auth;
pub mod config;
pub mod error;

#[cfg(feature = "s3")]
pub mod s3;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use config::AwsBaseConfig;
pub use error::AwsError;

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3ObjectStore};

#[cfg(feature = "sqs")]
pub use sqs::{SqsBroker, SqsConfig};
