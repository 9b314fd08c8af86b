//! Ingestion of object-store bucket notifications.
//!
//! A notification only says that an object appeared. Tenant and uploader
//! are read from the object's own metadata, and a regular upload-scan event
//! is published for the scan consumer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use tenantry_broker::{Message, Publisher, QueueBinding, SCAN_ROUTING_KEY, UPLOADS_DESTINATION};
use tenantry_core::{RetryStrategy, TenantId, UploadScanEvent, UserId};
use tenantry_storage::{ObjectInfo, ObjectStore, TENANT_ID_META, UPLOADED_BY_META};

use crate::error::PipelineError;
use crate::handler::MessageHandler;
use crate::upload::file_name_of;
use crate::work_queue::WorkQueue;

/// Queue that bucket notifications are delivered to.
pub const NOTIFICATION_QUEUE: &str = "bucket-notifications";
/// Destination bucket notifications are published to when they pass
/// through the broker rather than arriving on the queue directly.
pub const NOTIFICATION_DESTINATION: &str = "bucket-events";
pub const NOTIFICATION_ROUTING_KEY: &str = "object.created";

/// Binding for a notification queue named `queue`.
pub fn notification_binding(queue: impl Into<String>) -> QueueBinding {
    QueueBinding::new(queue, NOTIFICATION_DESTINATION, NOTIFICATION_ROUTING_KEY)
}

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_QUEUE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct BucketNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEntity {
    /// URL-encoded, with spaces as `+`.
    pub key: String,
    #[serde(default)]
    pub size: Option<i64>,
}

/// A created object named by a notification, key decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedObject {
    pub bucket: String,
    pub key: String,
}

impl BucketNotification {
    pub fn from_slice(payload: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(payload).map_err(|e| PipelineError::Malformed(e.to_string()))
    }

    /// Objects created by this notification. Other event types are skipped.
    pub fn created_objects(&self) -> Result<Vec<CreatedObject>, PipelineError> {
        self.records
            .iter()
            .filter(|r| {
                let created = is_object_created(&r.event_name);
                if !created {
                    debug!(event_name = %r.event_name, "ignoring notification record");
                }
                created
            })
            .map(|r| {
                Ok(CreatedObject {
                    bucket: r.s3.bucket.name.clone(),
                    key: decode_key(&r.s3.object.key)?,
                })
            })
            .collect()
    }
}

fn is_object_created(event_name: &str) -> bool {
    event_name
        .strip_prefix("s3:")
        .unwrap_or(event_name)
        .starts_with("ObjectCreated")
}

/// Decode a notification object key: `+` is a space, then percent-decoding.
pub fn decode_key(raw: &str) -> Result<String, PipelineError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|e| PipelineError::Malformed(format!("object key {raw:?}: {e}")))
}

/// Turns bucket notifications into upload-scan events.
#[derive(Clone)]
pub struct NotificationIngestor {
    storage: Arc<dyn ObjectStore>,
    publisher: Arc<dyn Publisher>,
    retry: RetryStrategy,
    max_attempts: u32,
}

impl std::fmt::Debug for NotificationIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationIngestor")
            .field("retry", &self.retry)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

fn required_meta<T: std::str::FromStr>(info: &ObjectInfo, name: &str) -> Result<T, PipelineError> {
    info.meta(name)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            PipelineError::Malformed(format!(
                "object {}/{} has no valid {name} metadata",
                info.bucket, info.key
            ))
        })
}

impl NotificationIngestor {
    pub fn new(storage: Arc<dyn ObjectStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            storage,
            publisher,
            retry: RetryStrategy::default(),
            max_attempts: DEFAULT_QUEUE_ATTEMPTS,
        }
    }

    /// Backoff for notifications taken from [`spawn_queue`](Self::spawn_queue).
    /// Broker deliveries are retried by redelivery instead.
    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, retry: RetryStrategy) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry = retry;
        self
    }

    /// Publish one upload-scan event per created object and return the
    /// events. Any record failing fails the whole notification; records
    /// published before the failure are republished on retry and absorbed
    /// by the scan consumer's duplicate check.
    #[instrument(skip_all, fields(payload_len = payload.len()))]
    pub async fn ingest(&self, payload: &[u8]) -> Result<Vec<UploadScanEvent>, PipelineError> {
        let notification = BucketNotification::from_slice(payload).inspect_err(|e| {
            error!(error = %e, "undecodable bucket notification");
        })?;
        let mut events = Vec::new();
        for object in notification.created_objects()? {
            if let Some(event) = self.announce(&object).await? {
                events.push(event);
            }
        }
        info!(published = events.len(), "notification ingested");
        Ok(events)
    }

    async fn announce(
        &self,
        object: &CreatedObject,
    ) -> Result<Option<UploadScanEvent>, PipelineError> {
        let Some(info) = self.storage.stat_object(&object.bucket, &object.key).await? else {
            // Deleted between notification and ingestion; nothing to scan.
            warn!(bucket = %object.bucket, object_key = %object.key, "notified object is gone");
            return Ok(None);
        };
        let tenant_id: TenantId = required_meta(&info, TENANT_ID_META)?;
        let uploaded_by_user_id: UserId = required_meta(&info, UPLOADED_BY_META)?;
        if tenant_id.is_nil() {
            return Err(PipelineError::Malformed("nil tenant id in metadata".into()));
        }

        let event = UploadScanEvent {
            tenant_id,
            bucket: info.bucket.clone(),
            object_key: info.key.clone(),
            uploaded_by_user_id,
            original_file_name: file_name_of(&info.key).to_owned(),
            content_type: info
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
            size: info.size,
        };
        self.publisher
            .publish(
                UPLOADS_DESTINATION,
                SCAN_ROUTING_KEY,
                Bytes::from(event.to_vec()?),
            )
            .await?;
        debug!(tenant_id = %tenant_id, object_key = %event.object_key, "scan event published");
        Ok(Some(event))
    }

    /// A bounded queue feeding notifications from an in-process producer
    /// into this ingestor.
    ///
    /// Retryable failures are retried with backoff, up to the configured
    /// attempts, while the worker holds the item. Poison notifications and
    /// exhausted retries are logged and dropped; the producer is not told.
    pub fn spawn_queue(self: Arc<Self>, capacity: usize, workers: usize) -> WorkQueue<Bytes> {
        WorkQueue::start(capacity, workers, move |payload: Bytes| {
            let ingestor = Arc::clone(&self);
            async move { ingestor.ingest_with_retry(&payload).await }
        })
    }

    async fn ingest_with_retry(&self, payload: &[u8]) {
        let mut attempt = 0u32;
        loop {
            let Err(e) = self.ingest(payload).await else {
                return;
            };
            attempt += 1;
            if !e.is_retryable() || e.is_poison() {
                error!(error = %e, "dropping queued notification");
                return;
            }
            if attempt >= self.max_attempts {
                error!(attempts = attempt, error = %e, "queued notification failed, giving up");
                return;
            }
            let delay = self.retry.delay_for(attempt - 1);
            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %e,
                "queued notification failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MessageHandler for NotificationIngestor {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn handle(&self, message: &Message) -> Result<(), PipelineError> {
        self.ingest(&message.payload).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(records: &[(&str, &str)]) -> Vec<u8> {
        let records: Vec<_> = records
            .iter()
            .map(|(name, key)| {
                serde_json::json!({
                    "eventVersion": "2.1",
                    "eventSource": "aws:s3",
                    "eventName": name,
                    "s3": {
                        "bucket": { "name": "uploads" },
                        "object": { "key": key, "size": 10 }
                    }
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({ "Records": records })).unwrap()
    }

    #[test]
    fn keys_are_decoded_with_plus_as_space() {
        assert_eq!(decode_key("tenants/t/1/my+scan%281%29.pdf").unwrap(), "tenants/t/1/my scan(1).pdf");
        assert_eq!(decode_key("a%2Bb").unwrap(), "a+b");
        assert!(decode_key("bad%FF").is_err());
    }

    #[test]
    fn only_created_events_are_kept() {
        let payload = notification(&[
            ("ObjectCreated:Put", "a.pdf"),
            ("ObjectRemoved:Delete", "b.pdf"),
            ("s3:ObjectCreated:CompleteMultipartUpload", "c.pdf"),
        ]);
        let objects = BucketNotification::from_slice(&payload)
            .unwrap()
            .created_objects()
            .unwrap();
        let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["a.pdf", "c.pdf"]);
    }

    #[test]
    fn test_event_without_records_is_empty() {
        let parsed = BucketNotification::from_slice(br#"{"Service":"Amazon S3","Event":"s3:TestEvent"}"#).unwrap();
        assert!(parsed.created_objects().unwrap().is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            BucketNotification::from_slice(b"<xml/>"),
            Err(PipelineError::Malformed(_))
        ));
    }
}
