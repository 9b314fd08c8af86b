use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StorageError;
use crate::store::ObjectStore;
use crate::types::{ObjectInfo, ObjectPut, PresignedUrl};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    metadata: HashMap<String, String>,
    last_modified: DateTime<Utc>,
}

/// In-process object store. Clones share the same objects.
///
/// Presigned URLs use a `memory://` scheme and are not dereferenceable; they
/// exist so the upload path can be exercised end to end.
#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<(String, String), StoredObject>>,
    chunk_size: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self {
            objects: Arc::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MemoryObjectStore {
    /// Header prefix carrying object metadata on presigned uploads.
    pub const META_HEADER_PREFIX: &'static str = "x-meta-";

    pub fn new() -> Self {
        Self::default()
    }

    /// Perform the upload a client would make with a presigned PUT URL from
    /// this store, sending every header the URL requires.
    pub fn upload_presigned(&self, url: &PresignedUrl, data: Bytes) -> Result<(), StorageError> {
        let target = url
            .url
            .strip_prefix("memory://")
            .and_then(|rest| rest.split_once('?'))
            .map(|(path, _)| path)
            .and_then(|path| path.split_once('/'))
            .filter(|_| url.method == "PUT")
            .ok_or_else(|| StorageError::Backend(format!("not a presigned upload: {}", url.url)))?;
        if url.expires_at < Utc::now() {
            return Err(StorageError::Backend("presigned url expired".into()));
        }
        let metadata = url
            .headers
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(Self::META_HEADER_PREFIX)
                    .map(|n| (n.to_owned(), value.clone()))
            })
            .collect();
        self.objects.insert(
            (target.0.to_owned(), target.1.to_owned()),
            StoredObject {
                data,
                content_type: url.headers.get("content-type").cloned().unwrap_or_default(),
                metadata,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    /// Size of the chunks sent by [`ObjectStore::stream_object`].
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// The stored bytes, for assertions.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .map(|o| o.data.clone())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .contains_key(&(bucket.to_owned(), key.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn presign(bucket: &str, key: &str, method: &str, ttl: Duration) -> PresignedUrl {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        PresignedUrl {
            url: format!(
                "memory://{bucket}/{key}?method={method}&expires={}",
                expires_at.timestamp()
            ),
            method: method.to_owned(),
            expires_at,
            headers: HashMap::new(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<PresignedUrl, StorageError> {
        let mut url = Self::presign(bucket, key, "PUT", ttl);
        url.headers
            .insert("content-type".to_owned(), content_type.to_owned());
        for (name, value) in metadata {
            url.headers.insert(
                format!("{}{}", Self::META_HEADER_PREFIX, name.to_ascii_lowercase()),
                value.clone(),
            );
        }
        Ok(url)
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, StorageError> {
        Ok(Self::presign(bucket, key, "GET", ttl))
    }

    async fn put_object(&self, object: ObjectPut) -> Result<(), StorageError> {
        debug!(bucket = %object.bucket, key = %object.key, size = object.data.len(), "storing object");
        self.objects.insert(
            (object.bucket, object.key),
            StoredObject {
                data: object.data,
                content_type: object.content_type,
                metadata: object.metadata,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn stream_object(
        &self,
        bucket: &str,
        key: &str,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<u64, StorageError> {
        // Clone the handle out so no map guard is held across awaits.
        let data = self
            .object(bucket, key)
            .ok_or_else(|| StorageError::not_found(bucket, key))?;
        let mut sent = 0u64;
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            sink.send(data.slice(offset..end))
                .await
                .map_err(|_| StorageError::SinkClosed)?;
            sent += (end - offset) as u64;
            offset = end;
        }
        Ok(sent)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.objects.remove(&(bucket.to_owned(), key.to_owned()));
        Ok(())
    }

    async fn stat_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, StorageError> {
        Ok(self
            .objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .map(|o| ObjectInfo {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                size: i64::try_from(o.data.len()).unwrap_or(i64::MAX),
                content_type: Some(o.content_type.clone()),
                metadata: o.metadata.clone(),
                last_modified: Some(o.last_modified),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TENANT_ID_META;

    #[tokio::test]
    async fn put_stat_stream_delete() {
        let store = MemoryObjectStore::new().with_chunk_size(4);
        store
            .put_object(
                ObjectPut::new("b", "k", "text/plain", Bytes::from_static(b"0123456789"))
                    .with_meta("Tenant-Id", "t-1"),
            )
            .await
            .unwrap();

        let info = store.stat_object("b", "k").await.unwrap().unwrap();
        assert_eq!(info.size, 10);
        assert_eq!(info.meta(TENANT_ID_META), Some("t-1"));

        let (tx, mut rx) = mpsc::channel(8);
        let sent = store.stream_object("b", "k", tx).await.unwrap();
        assert_eq!(sent, 10);
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"0123456789");

        store.delete_object("b", "k").await.unwrap();
        store.delete_object("b", "k").await.unwrap();
        assert!(store.stat_object("b", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_missing_object() {
        let store = MemoryObjectStore::new();
        let (tx, _rx) = mpsc::channel(1);
        let err = store.stream_object("b", "nope", tx).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn stream_into_dropped_sink() {
        let store = MemoryObjectStore::new();
        store
            .put_object(ObjectPut::new("b", "k", "text/plain", Bytes::from_static(b"x")))
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = store.stream_object("b", "k", tx).await.unwrap_err();
        assert!(matches!(err, StorageError::SinkClosed));
    }

    #[tokio::test]
    async fn presigned_put_carries_content_type() {
        let store = MemoryObjectStore::new();
        let metadata = HashMap::from([(TENANT_ID_META.to_owned(), "t-1".to_owned())]);
        let url = store
            .presign_put("b", "k", "image/png", &metadata, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(url.method, "PUT");
        assert!(url.url.starts_with("memory://b/k"));
        assert_eq!(url.headers.get("content-type").map(String::as_str), Some("image/png"));
        assert_eq!(url.headers.get("x-meta-tenant-id").map(String::as_str), Some("t-1"));
        assert!(url.expires_at > Utc::now());

        store
            .upload_presigned(&url, Bytes::from_static(b"png"))
            .unwrap();
        let info = store.stat_object("b", "k").await.unwrap().unwrap();
        assert_eq!(info.meta(TENANT_ID_META), Some("t-1"));
        assert_eq!(info.content_type.as_deref(), Some("image/png"));
    }
}
