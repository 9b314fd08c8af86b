use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Limits applied to an upload before any URL is issued or byte stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    pub max_size_bytes: i64,
    /// Lifetime of presigned upload and download URLs, in seconds.
    pub url_ttl_seconds: u64,
    /// Accepted content types, compared case-insensitively without
    /// parameters.
    pub allowed_content_types: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024,
            url_ttl_seconds: 5 * 60,
            allowed_content_types: vec![
                "image/jpeg".to_owned(),
                "image/png".to_owned(),
                "application/pdf".to_owned(),
            ],
        }
    }
}

/// What a client declares about a file it wants to upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    pub content_type: String,
    pub size: i64,
}

impl UploadRequest {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, size: i64) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            size,
        }
    }
}

impl UploadPolicy {
    #[must_use]
    pub fn with_max_size_bytes(mut self, max: i64) -> Self {
        self.max_size_bytes = max;
        self
    }

    #[must_use]
    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl_seconds = ttl.as_secs();
        self
    }

    #[must_use]
    pub fn with_allowed_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_content_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_seconds)
    }

    /// Check `request` and return its normalized content type.
    pub fn validate(&self, request: &UploadRequest) -> Result<String, PipelineError> {
        if request.file_name.trim().is_empty() {
            return Err(PipelineError::UploadRejected("file name is empty".into()));
        }
        if request.size <= 0 {
            return Err(PipelineError::UploadRejected("file is empty".into()));
        }
        if request.size > self.max_size_bytes {
            return Err(PipelineError::UploadRejected(format!(
                "file is {} bytes, the limit is {}",
                request.size, self.max_size_bytes
            )));
        }
        let content_type = normalize_content_type(&request.content_type);
        if !self
            .allowed_content_types
            .iter()
            .any(|allowed| normalize_content_type(allowed) == content_type)
        {
            return Err(PipelineError::UploadRejected(format!(
                "content type {content_type:?} is not allowed"
            )));
        }
        Ok(content_type)
    }
}

fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = UploadPolicy::default();
        assert_eq!(policy.max_size_bytes, 10 * 1024 * 1024);
        assert_eq!(policy.url_ttl(), Duration::from_secs(300));
        assert_eq!(policy.allowed_content_types.len(), 3);
    }

    #[test]
    fn accepts_allowed_type_with_parameters() {
        let policy = UploadPolicy::default();
        let ct = policy
            .validate(&UploadRequest::new("scan.pdf", "Application/PDF; charset=binary", 1024))
            .unwrap();
        assert_eq!(ct, "application/pdf");
    }

    #[test]
    fn rejects_oversized_empty_and_unknown_types() {
        let policy = UploadPolicy::default();
        for request in [
            UploadRequest::new("big.png", "image/png", 10 * 1024 * 1024 + 1),
            UploadRequest::new("empty.png", "image/png", 0),
            UploadRequest::new("run.exe", "application/x-msdownload", 10),
            UploadRequest::new(" ", "image/png", 10),
        ] {
            assert!(
                matches!(policy.validate(&request), Err(PipelineError::UploadRejected(_))),
                "{request:?}"
            );
        }
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let policy: UploadPolicy =
            serde_json::from_value(serde_json::json!({ "max_size_bytes": 2048 })).unwrap();
        assert_eq!(policy.max_size_bytes, 2048);
        assert_eq!(policy.url_ttl_seconds, 300);
    }
}
