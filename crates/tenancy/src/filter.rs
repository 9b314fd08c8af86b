//! Read-side tenant filtering.

use tenantry_core::{Entity, TenantId};
use tenantry_store::{Row, RowQuery, RowScope};

use crate::error::GuardError;
use crate::registry::EntityRegistry;

/// Whether reads see soft-deleted rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Visibility {
    #[default]
    Live,
    /// Also return tombstoned rows. Used for duplicate checks.
    IncludeDeleted,
}

/// Scope applied to every read of a registered type.
///
/// Tenant-scoped kinds are restricted to the context tenant; with an empty
/// context they match nothing. Unscoped kinds are never filtered by tenant.
#[derive(Debug, Clone, Copy)]
pub struct TenantFilter<'a> {
    registry: &'a EntityRegistry,
    tenant: Option<TenantId>,
}

impl<'a> TenantFilter<'a> {
    pub fn new(registry: &'a EntityRegistry, tenant: Option<TenantId>) -> Self {
        Self { registry, tenant }
    }

    /// The row scope for reads of `E`, or `None` when nothing may be seen.
    pub fn scope<E: Entity>(&self) -> Result<Option<RowScope>, GuardError> {
        let descriptor = self.registry.descriptor::<E>()?;
        if !descriptor.is_tenant_scoped() {
            return Ok(Some(RowScope::AllTenants));
        }
        Ok(self.tenant.map(RowScope::Tenant))
    }

    /// A list query for `E`, or `None` when nothing may be seen.
    pub fn query<E: Entity>(&self, visibility: Visibility) -> Result<Option<RowQuery>, GuardError> {
        Ok(self.scope::<E>()?.map(|scope| {
            let query = RowQuery::new(E::KIND, scope);
            match visibility {
                Visibility::Live => query,
                Visibility::IncludeDeleted => query.with_deleted(),
            }
        }))
    }

    /// Final check on a row returned by a point read.
    pub fn admits(&self, scope: RowScope, visibility: Visibility, row: &Row) -> bool {
        scope.admits(row) && (visibility == Visibility::IncludeDeleted || !row.deleted)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use tenantry_core::FileRecord;

    use super::*;
    use crate::registry::{EntityDescriptor, default_registry};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Region {
        code: String,
    }

    impl Entity for Region {
        const KIND: &'static str = "region";

        fn id(&self) -> String {
            self.code.clone()
        }
    }

    fn row(tenant: TenantId, deleted: bool) -> Row {
        Row {
            kind: "file".into(),
            id: "1".into(),
            tenant_id: Some(tenant),
            natural_key: None,
            body: serde_json::json!({}),
            deleted,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn scoped_kind_uses_context_tenant() {
        let registry = default_registry();
        let tenant = TenantId::generate();
        let filter = TenantFilter::new(&registry, Some(tenant));
        assert_eq!(
            filter.scope::<FileRecord>().unwrap(),
            Some(RowScope::Tenant(tenant))
        );
    }

    #[test]
    fn empty_context_sees_nothing() {
        let registry = default_registry();
        let filter = TenantFilter::new(&registry, None);
        assert_eq!(filter.scope::<FileRecord>().unwrap(), None);
        assert!(filter.query::<FileRecord>(Visibility::Live).unwrap().is_none());
    }

    #[test]
    fn unscoped_kind_is_unfiltered() {
        let mut registry = EntityRegistry::new();
        registry.register(EntityDescriptor::<Region>::global());
        let filter = TenantFilter::new(&registry, None);
        assert_eq!(filter.scope::<Region>().unwrap(), Some(RowScope::AllTenants));
    }

    #[test]
    fn deleted_rows_hidden_unless_requested() {
        let registry = default_registry();
        let tenant = TenantId::generate();
        let filter = TenantFilter::new(&registry, Some(tenant));
        let scope = RowScope::Tenant(tenant);
        assert!(filter.admits(scope, Visibility::Live, &row(tenant, false)));
        assert!(!filter.admits(scope, Visibility::Live, &row(tenant, true)));
        assert!(filter.admits(scope, Visibility::IncludeDeleted, &row(tenant, true)));
        assert!(!filter.admits(scope, Visibility::Live, &row(TenantId::generate(), false)));

        let query = filter
            .query::<FileRecord>(Visibility::IncludeDeleted)
            .unwrap()
            .unwrap();
        assert!(query.include_deleted);
    }
}
