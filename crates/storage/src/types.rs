use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object metadata entry carrying the owning tenant id.
///
/// Providers expose user metadata as `x-<provider>-meta-<name>` headers; the
/// names here are the bare `<name>` part.
pub const TENANT_ID_META: &str = "tenant-id";
/// Object metadata entry carrying the uploading user id.
pub const UPLOADED_BY_META: &str = "uploaded-by-user-id";

/// A time-limited URL for direct client access to one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    /// `PUT` or `GET`.
    pub method: String,
    pub expires_at: DateTime<Utc>,
    /// Headers the client must send with the request, e.g. `content-type`.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Stat result for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub size: i64,
    pub content_type: Option<String>,
    /// User metadata with lower-cased names.
    pub metadata: HashMap<String, String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectInfo {
    pub fn meta(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).map(String::as_str)
    }
}

/// A whole-object write.
#[derive(Debug, Clone)]
pub struct ObjectPut {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub data: Bytes,
    pub metadata: HashMap<String, String>,
}

impl ObjectPut {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        content_type: impl Into<String>,
        data: Bytes,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            content_type: content_type.into(),
            data,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }
}
