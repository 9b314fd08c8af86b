use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::StorageError;
use crate::types::{ObjectInfo, ObjectPut, PresignedUrl};

/// Pluggable object storage backend.
///
/// Implementations must be `Send + Sync` to be shared across async tasks.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// A URL allowing the holder to upload `key` with `content_type` until
    /// `ttl` elapses. `metadata` is signed into the request, so the upload
    /// only succeeds if the client sends the returned headers unchanged.
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<PresignedUrl, StorageError>;

    /// A URL allowing the holder to download `key` until `ttl` elapses.
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, StorageError>;

    /// Store a whole object with its metadata.
    async fn put_object(&self, object: ObjectPut) -> Result<(), StorageError>;

    /// Stream the object's bytes into `sink` chunk by chunk and return the
    /// number of bytes sent. The sink is dropped when the call returns,
    /// which ends the stream for the reader.
    async fn stream_object(
        &self,
        bucket: &str,
        key: &str,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<u64, StorageError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Size, content type and metadata, or `None` when absent.
    async fn stat_object(&self, bucket: &str, key: &str)
    -> Result<Option<ObjectInfo>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_dyn_object_store(_: &dyn ObjectStore) {}
}
