use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{TenantId, UserId};

/// Announcement that an object has been stored and needs scanning.
///
/// This is the wire format on the broker, so field names are camelCase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadScanEvent {
    pub tenant_id: TenantId,
    pub bucket: String,
    pub object_key: String,
    pub uploaded_by_user_id: UserId,
    pub original_file_name: String,
    pub content_type: String,
    pub size: i64,
}

impl UploadScanEvent {
    /// Decode and validate a broker payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, CoreError> {
        let event: Self =
            serde_json::from_slice(payload).map_err(|e| CoreError::InvalidEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(|e| CoreError::InvalidEvent(e.to_string()))
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.tenant_id.is_nil() {
            return Err(CoreError::InvalidEvent("tenantId is nil".into()));
        }
        if self.bucket.trim().is_empty() {
            return Err(CoreError::InvalidEvent("bucket is empty".into()));
        }
        if self.object_key.trim().is_empty() {
            return Err(CoreError::InvalidEvent("objectKey is empty".into()));
        }
        if self.size < 0 {
            return Err(CoreError::InvalidEvent(format!(
                "size must not be negative, got {}",
                self.size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UploadScanEvent {
        UploadScanEvent {
            tenant_id: TenantId::generate(),
            bucket: "uploads".into(),
            object_key: "tenants/x/report.pdf".into(),
            uploaded_by_user_id: UserId::generate(),
            original_file_name: "report.pdf".into(),
            content_type: "application/pdf".into(),
            size: 1024,
        }
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json: serde_json::Value = serde_json::from_slice(&sample().to_vec().unwrap()).unwrap();
        for field in [
            "tenantId",
            "bucket",
            "objectKey",
            "uploadedByUserId",
            "originalFileName",
            "contentType",
            "size",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn decodes_valid_payload() {
        let event = sample();
        let decoded = UploadScanEvent::from_slice(&event.to_vec().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = UploadScanEvent::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, CoreError::InvalidEvent(_)));
    }

    #[test]
    fn rejects_missing_fields() {
        let err = UploadScanEvent::from_slice(br#"{"bucket":"b"}"#).unwrap_err();
        assert!(matches!(err, CoreError::InvalidEvent(_)));
    }

    #[test]
    fn rejects_empty_key_and_negative_size() {
        let mut event = sample();
        event.object_key = " ".into();
        assert!(UploadScanEvent::from_slice(&event.to_vec().unwrap()).is_err());

        let mut event = sample();
        event.size = -1;
        assert!(UploadScanEvent::from_slice(&event.to_vec().unwrap()).is_err());
    }
}
