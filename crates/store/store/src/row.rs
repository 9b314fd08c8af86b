use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tenantry_core::TenantId;

use crate::error::StoreError;

/// A stored entity: its kind, identity, owning tenant and JSON body.
///
/// `tenant_id` and `deleted` are projections of the body kept as columns so
/// backends can filter without parsing JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub kind: String,
    pub id: String,
    pub tenant_id: Option<TenantId>,
    /// Unique within `kind` when present.
    pub natural_key: Option<String>,
    pub body: serde_json::Value,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

/// Which tenants a read may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowScope {
    /// No tenant predicate. Used for kinds that are not tenant-scoped.
    AllTenants,
    /// Only rows owned by this tenant.
    Tenant(TenantId),
}

impl RowScope {
    pub fn admits(&self, row: &Row) -> bool {
        match self {
            Self::AllTenants => true,
            Self::Tenant(tenant) => row.tenant_id == Some(*tenant),
        }
    }
}

/// Filter for [`RowStore::list`].
#[derive(Debug, Clone)]
pub struct RowQuery {
    pub kind: String,
    pub scope: RowScope,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn new(kind: impl Into<String>, scope: RowScope) -> Self {
        Self {
            kind: kind.into(),
            scope,
            include_deleted: false,
            limit: None,
        }
    }

    #[must_use]
    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    SoftDelete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::SoftDelete => "soft_delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "soft_delete" => Some(Self::SoftDelete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited mutation, written in the same transaction as the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: Uuid,
    pub tenant_id: Option<TenantId>,
    pub entity_kind: String,
    pub entity_id: String,
    pub operation: ChangeOperation,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// Generic entity storage used beneath the persistence guard.
///
/// Implementations must be `Send + Sync` to be shared across async tasks.
/// Reads return soft-deleted rows too; hiding them is the caller's decision.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Open a transaction. Every mutation goes through one.
    async fn begin(&self) -> Result<Box<dyn RowTransaction>, StoreError>;

    /// Fetch a row by kind and id, restricted to `scope`.
    async fn get(&self, kind: &str, id: &str, scope: RowScope) -> Result<Option<Row>, StoreError>;

    /// Fetch a row by its natural key, restricted to `scope`.
    async fn find_by_natural_key(
        &self,
        kind: &str,
        natural_key: &str,
        scope: RowScope,
    ) -> Result<Option<Row>, StoreError>;

    /// List rows of one kind, ordered by id.
    async fn list(&self, query: &RowQuery) -> Result<Vec<Row>, StoreError>;

    /// Change-log entries in write order, optionally for one tenant.
    async fn change_log(&self, tenant: Option<TenantId>)
    -> Result<Vec<ChangeLogEntry>, StoreError>;
}

/// An open unit of work. Dropping it without [`commit`](Self::commit)
/// discards every write.
#[async_trait]
pub trait RowTransaction: Send {
    /// Read the committed-or-staged row, locking it for the rest of the
    /// transaction where the backend supports row locks. Unscoped: callers
    /// use it to learn the stored owner of a row.
    async fn fetch(&mut self, kind: &str, id: &str) -> Result<Option<Row>, StoreError>;

    /// Insert a new row. Fails with [`StoreError::UniqueViolation`] when the
    /// id or natural key is taken.
    async fn insert(&mut self, row: Row) -> Result<(), StoreError>;

    /// Replace an existing row. Fails with [`StoreError::NotFound`] when absent.
    async fn update(&mut self, row: Row) -> Result<(), StoreError>;

    /// Physically remove a row. Returns whether it existed.
    async fn delete(&mut self, kind: &str, id: &str) -> Result<bool, StoreError>;

    async fn append_change(&mut self, entry: ChangeLogEntry) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_dyn_row_store(_: &dyn RowStore) {}
    fn _assert_dyn_row_transaction(_: &dyn RowTransaction) {}

    fn row(tenant: Option<TenantId>) -> Row {
        Row {
            kind: "file".into(),
            id: "1".into(),
            tenant_id: tenant,
            natural_key: None,
            body: serde_json::json!({}),
            deleted: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn scope_admits_only_owner() {
        let t1 = TenantId::generate();
        let t2 = TenantId::generate();
        assert!(RowScope::Tenant(t1).admits(&row(Some(t1))));
        assert!(!RowScope::Tenant(t2).admits(&row(Some(t1))));
        assert!(!RowScope::Tenant(t1).admits(&row(None)));
        assert!(RowScope::AllTenants.admits(&row(None)));
    }

    #[test]
    fn change_operation_parse() {
        for op in [
            ChangeOperation::Insert,
            ChangeOperation::Update,
            ChangeOperation::Delete,
            ChangeOperation::SoftDelete,
        ] {
            assert_eq!(ChangeOperation::parse(op.as_str()), Some(op));
        }
        assert_eq!(ChangeOperation::parse("upsert"), None);
    }
}
