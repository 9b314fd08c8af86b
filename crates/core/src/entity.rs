//! Persistence identity and the audit/tombstone field groups shared by
//! tenant-scoped entities.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A value that can be stored as a row by the persistence layer.
///
/// Tenant ownership is deliberately absent from this trait: whether an entity
/// is tenant-scoped, and how its tenant field is read and written, is declared
/// once in the tenancy crate's entity registry.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable kind name, used as the row discriminator.
    const KIND: &'static str;

    /// Primary identifier of this entity.
    fn id(&self) -> String;

    /// Optional secondary key that must be unique within the kind.
    fn natural_key(&self) -> Option<String> {
        None
    }
}

/// Creation and modification stamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStamp {
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
}

/// Soft-delete marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

impl Tombstone {
    /// Mark as deleted by `actor` at `at`. Re-marking keeps the first stamp.
    pub fn mark(&mut self, actor: &str, at: DateTime<Utc>) {
        if self.deleted {
            return;
        }
        self.deleted = true;
        self.deleted_at = Some(at);
        self.deleted_by = Some(actor.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_mark_is_sticky() {
        let mut t = Tombstone::default();
        let first = Utc::now();
        t.mark("system", first);
        t.mark("someone-else", first + chrono::Duration::seconds(5));
        assert!(t.deleted);
        assert_eq!(t.deleted_at, Some(first));
        assert_eq!(t.deleted_by.as_deref(), Some("system"));
    }
}
