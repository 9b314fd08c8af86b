use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{AuditStamp, Entity, Tombstone};
use crate::error::CoreError;
use crate::types::{TenantId, UserId};

/// Lifecycle of an uploaded object.
///
/// `PendingScan` is the only non-terminal state; a file moves from it to
/// exactly one of the two terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    PendingScan,
    ScannedClean,
    ScannedInfected,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingScan => "pending_scan",
            Self::ScannedClean => "scanned_clean",
            Self::ScannedInfected => "scanned_infected",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::PendingScan)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::PendingScan, Self::ScannedClean | Self::ScannedInfected)
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored object and its scan state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    /// Owning tenant. Unset until the persistence guard assigns it.
    pub tenant_id: Option<TenantId>,
    pub bucket: String,
    pub object_key: String,
    pub original_file_name: String,
    pub content_type: String,
    pub size: i64,
    /// Hex SHA-256 of the scanned bytes, set when the scan completes.
    pub checksum: Option<String>,
    pub scan_status: ScanStatus,
    /// Scanner signature name when infected.
    pub scan_result_details: Option<String>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub uploaded_by: Option<UserId>,
    #[serde(default)]
    pub audit: AuditStamp,
    #[serde(default)]
    pub tombstone: Tombstone,
}

impl FileRecord {
    /// A freshly ingested file awaiting its scan.
    pub fn pending(
        bucket: impl Into<String>,
        object_key: impl Into<String>,
        original_file_name: impl Into<String>,
        content_type: impl Into<String>,
        size: i64,
        uploaded_by: Option<UserId>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id: None,
            bucket: bucket.into(),
            object_key: object_key.into(),
            original_file_name: original_file_name.into(),
            content_type: content_type.into(),
            size,
            checksum: None,
            scan_status: ScanStatus::PendingScan,
            scan_result_details: None,
            scanned_at: None,
            uploaded_by,
            audit: AuditStamp::default(),
            tombstone: Tombstone::default(),
        }
    }

    fn transition(&mut self, next: ScanStatus) -> Result<(), CoreError> {
        if !self.scan_status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.scan_status.to_string(),
                to: next.to_string(),
            });
        }
        self.scan_status = next;
        Ok(())
    }

    /// Record a clean scan of `size` bytes hashing to `checksum`.
    pub fn mark_clean(
        &mut self,
        checksum: impl Into<String>,
        size: i64,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.transition(ScanStatus::ScannedClean)?;
        self.checksum = Some(checksum.into());
        self.size = size;
        self.scanned_at = Some(at);
        Ok(())
    }

    /// Record an infected scan. The tombstone is applied by the persistence
    /// layer when the record is deleted.
    pub fn mark_infected(
        &mut self,
        signature: Option<String>,
        checksum: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.transition(ScanStatus::ScannedInfected)?;
        self.scan_result_details = signature;
        self.checksum = checksum;
        self.scanned_at = Some(at);
        Ok(())
    }
}

impl Entity for FileRecord {
    const KIND: &'static str = "file";

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn natural_key(&self) -> Option<String> {
        Some(self.object_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> FileRecord {
        FileRecord::pending("uploads", "tenants/t/a.pdf", "a.pdf", "application/pdf", 10, None)
    }

    #[test]
    fn pending_to_clean() {
        let mut f = file();
        f.mark_clean("abc", 12, Utc::now()).unwrap();
        assert_eq!(f.scan_status, ScanStatus::ScannedClean);
        assert_eq!(f.checksum.as_deref(), Some("abc"));
        assert_eq!(f.size, 12);
        assert!(f.scanned_at.is_some());
    }

    #[test]
    fn pending_to_infected() {
        let mut f = file();
        f.mark_infected(Some("Eicar-Signature".into()), None, Utc::now())
            .unwrap();
        assert_eq!(f.scan_status, ScanStatus::ScannedInfected);
        assert_eq!(f.scan_result_details.as_deref(), Some("Eicar-Signature"));
    }

    #[test]
    fn terminal_states_are_final() {
        let mut f = file();
        f.mark_clean("abc", 10, Utc::now()).unwrap();
        let err = f.mark_infected(None, None, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert!(f.mark_clean("abc", 10, Utc::now()).is_err());
        assert_eq!(f.scan_status, ScanStatus::ScannedClean);
    }

    #[test]
    fn status_helpers() {
        assert!(!ScanStatus::PendingScan.is_terminal());
        assert!(ScanStatus::ScannedClean.is_terminal());
        assert!(ScanStatus::ScannedInfected.is_terminal());
        assert!(!ScanStatus::ScannedClean.can_transition_to(ScanStatus::PendingScan));
        assert_eq!(ScanStatus::ScannedInfected.to_string(), "scanned_infected");
    }

    #[test]
    fn natural_key_is_object_key() {
        assert_eq!(file().natural_key().as_deref(), Some("tenants/t/a.pdf"));
    }
}
