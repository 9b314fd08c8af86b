use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::{HeadObjectError, HeadObjectOutput};
use aws_sdk_s3::presigning::{PresignedRequest, PresigningConfig};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use tenantry_storage::{ObjectInfo, ObjectPut, ObjectStore, PresignedUrl, StorageError};

use crate::auth::build_sdk_config;
use crate::config::AwsBaseConfig;
use crate::error::{AwsError, classify_error_chain};

/// Configuration for the S3 object store.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(flatten)]
    pub aws: AwsBaseConfig,

    /// Address buckets as `endpoint/bucket` rather than `bucket.endpoint`.
    /// Required by MinIO and most self-hosted S3 implementations.
    #[serde(default)]
    pub force_path_style: bool,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("aws", &self.aws)
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

impl S3Config {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            aws: AwsBaseConfig::new(region),
            force_path_style: false,
        }
    }

    #[must_use]
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.aws.endpoint_url = Some(endpoint_url.into());
        self
    }

    #[must_use]
    pub fn with_force_path_style(mut self, force_path_style: bool) -> Self {
        self.force_path_style = force_path_style;
        self
    }
}

/// [`ObjectStore`] backed by Amazon S3 or an S3-compatible service.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("client", &"<S3Client>")
            .finish()
    }
}

impl S3ObjectStore {
    pub async fn new(config: &S3Config) -> Self {
        let sdk_config = build_sdk_config(&config.aws).await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
        }
    }

    pub fn with_client(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

fn failed(operation: &'static str, err: &dyn std::error::Error) -> StorageError {
    let classified = classify_error_chain(err);
    error!(operation, error = %classified, "S3 request failed");
    classified.into()
}

fn presigning(ttl: Duration) -> Result<PresigningConfig, StorageError> {
    PresigningConfig::expires_in(ttl)
        .map_err(|e| AwsError::Configuration(format!("invalid presign ttl: {e}")).into())
}

fn presigned_url(request: &PresignedRequest, ttl: Duration) -> PresignedUrl {
    let expires_at =
        Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
    PresignedUrl {
        url: request.uri().to_owned(),
        method: request.method().to_owned(),
        expires_at,
        headers: request
            .headers()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.to_owned()))
            .collect(),
    }
}

fn object_info(bucket: &str, key: &str, head: &HeadObjectOutput) -> ObjectInfo {
    ObjectInfo {
        bucket: bucket.to_owned(),
        key: key.to_owned(),
        size: head.content_length().unwrap_or(0),
        content_type: head.content_type().map(str::to_owned),
        metadata: head
            .metadata()
            .map(|m| {
                m.iter()
                    .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                    .collect()
            })
            .unwrap_or_default(),
        last_modified: head
            .last_modified()
            .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, metadata), fields(backend = "s3"))]
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<PresignedUrl, StorageError> {
        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .presigned(presigning(ttl)?)
            .await
            .map_err(|e| failed("presign_put", &e))?;
        Ok(presigned_url(&request, ttl))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, StorageError> {
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning(ttl)?)
            .await
            .map_err(|e| failed("presign_get", &e))?;
        Ok(presigned_url(&request, ttl))
    }

    #[instrument(skip_all, fields(backend = "s3", bucket = %object.bucket, key = %object.key))]
    async fn put_object(&self, object: ObjectPut) -> Result<(), StorageError> {
        let size = object.data.len();
        let metadata: HashMap<String, String> = object.metadata;
        self.client
            .put_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .content_type(&object.content_type)
            .set_metadata(Some(metadata))
            .body(ByteStream::from(object.data))
            .send()
            .await
            .map_err(|e| failed("put_object", &e))?;
        info!(size, "object stored");
        Ok(())
    }

    #[instrument(skip(self, sink), fields(backend = "s3"))]
    async fn stream_object(
        &self,
        bucket: &str,
        key: &str,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<u64, StorageError> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(GetObjectError::is_no_such_key) => {
                return Err(StorageError::not_found(bucket, key));
            }
            Err(e) => return Err(failed("get_object", &e)),
        };

        let mut body = output.body;
        let mut sent = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| failed("get_object_body", &e))?;
            sent += chunk.len() as u64;
            debug!(chunk = chunk.len(), sent, "forwarding object chunk");
            sink.send(chunk)
                .await
                .map_err(|_| StorageError::SinkClosed)?;
        }
        Ok(sent)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        // S3 reports success for a missing key.
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| failed("delete_object", &e))?;
        info!("object deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn stat_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, StorageError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(head) => Ok(Some(object_info(bucket, key, &head))),
            Err(e) if e.as_service_error().is_some_and(HeadObjectError::is_not_found) => Ok(None),
            Err(e) => Err(failed("head_object", &e)),
        }
    }
}
