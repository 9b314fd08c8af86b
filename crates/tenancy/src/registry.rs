//! Explicit registration of persisted entity types.
//!
//! Each type is registered once with accessors for its tenant field and,
//! where present, its audit and tombstone fields. The guard and the read
//! filter look the descriptor up here; an unregistered type cannot be
//! written or read.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use tenantry_core::{AuditStamp, Entity, FeatureOverride, FileRecord, TenantId, Tombstone};

use crate::error::GuardError;
use crate::redact::Redactor;

/// How the persistence layer reaches into one entity type.
pub struct EntityDescriptor<E> {
    /// Present for tenant-scoped types.
    pub(crate) tenant: Option<TenantField<E>>,
    pub(crate) audit: Option<fn(&mut E) -> &mut AuditStamp>,
    pub(crate) tombstone: Option<TombstoneField<E>>,
    pub(crate) redactor: Redactor,
}

pub(crate) struct TenantField<E> {
    pub(crate) get: fn(&E) -> Option<TenantId>,
    pub(crate) set: fn(&mut E, TenantId),
}

pub(crate) struct TombstoneField<E> {
    pub(crate) get: fn(&E) -> &Tombstone,
    pub(crate) get_mut: fn(&mut E) -> &mut Tombstone,
}

impl<E> std::fmt::Debug for EntityDescriptor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("tenant_scoped", &self.tenant.is_some())
            .field("audited", &self.audit.is_some())
            .field("soft_delete", &self.tombstone.is_some())
            .finish_non_exhaustive()
    }
}

impl<E: Entity> EntityDescriptor<E> {
    /// A type that is not tenant-scoped.
    pub fn global() -> Self {
        Self {
            tenant: None,
            audit: None,
            tombstone: None,
            redactor: Redactor::default(),
        }
    }

    /// A tenant-scoped type with the given tenant accessors.
    pub fn tenant_scoped(get: fn(&E) -> Option<TenantId>, set: fn(&mut E, TenantId)) -> Self {
        Self {
            tenant: Some(TenantField { get, set }),
            ..Self::global()
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: fn(&mut E) -> &mut AuditStamp) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Deletes of this type become tombstones instead of row removal.
    #[must_use]
    pub fn with_soft_delete(
        mut self,
        get: fn(&E) -> &Tombstone,
        get_mut: fn(&mut E) -> &mut Tombstone,
    ) -> Self {
        self.tombstone = Some(TombstoneField { get, get_mut });
        self
    }

    /// Fields masked in change-log snapshots.
    #[must_use]
    pub fn with_pii_fields(mut self, fields: &[&str]) -> Self {
        self.redactor = Redactor::new(fields);
        self
    }

    pub fn is_tenant_scoped(&self) -> bool {
        self.tenant.is_some()
    }

    pub fn supports_soft_delete(&self) -> bool {
        self.tombstone.is_some()
    }

    /// Tenant of `entity`, or `None` for unset or unscoped.
    pub fn tenant_of(&self, entity: &E) -> Option<TenantId> {
        self.tenant.as_ref().and_then(|t| (t.get)(entity))
    }

    pub fn is_deleted(&self, entity: &E) -> bool {
        self.tombstone
            .as_ref()
            .is_some_and(|t| (t.get)(entity).deleted)
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }
}

/// Descriptors for every persisted entity type, keyed by Rust type.
#[derive(Default)]
pub struct EntityRegistry {
    descriptors: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    kinds: HashMap<&'static str, TypeId>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E`, replacing any earlier descriptor for it.
    pub fn register<E: Entity>(&mut self, descriptor: EntityDescriptor<E>) -> &mut Self {
        self.kinds.insert(E::KIND, TypeId::of::<E>());
        self.descriptors
            .insert(TypeId::of::<E>(), Box::new(descriptor));
        self
    }

    /// The descriptor for `E`.
    pub fn descriptor<E: Entity>(&self) -> Result<&EntityDescriptor<E>, GuardError> {
        self.descriptors
            .get(&TypeId::of::<E>())
            .and_then(|d| d.downcast_ref::<EntityDescriptor<E>>())
            .ok_or(GuardError::UnregisteredEntity(E::KIND))
    }

    /// Whether a type with this kind name is registered.
    pub fn contains_kind(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.keys().copied()
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("EntityRegistry").field("kinds", &kinds).finish()
    }
}

fn file_tenant(f: &FileRecord) -> Option<TenantId> {
    f.tenant_id
}

fn set_file_tenant(f: &mut FileRecord, tenant: TenantId) {
    f.tenant_id = Some(tenant);
}

fn file_audit(f: &mut FileRecord) -> &mut AuditStamp {
    &mut f.audit
}

fn file_tombstone(f: &FileRecord) -> &Tombstone {
    &f.tombstone
}

fn file_tombstone_mut(f: &mut FileRecord) -> &mut Tombstone {
    &mut f.tombstone
}

fn override_tenant(o: &FeatureOverride) -> Option<TenantId> {
    o.tenant_id
}

fn set_override_tenant(o: &mut FeatureOverride, tenant: TenantId) {
    o.tenant_id = Some(tenant);
}

fn override_audit(o: &mut FeatureOverride) -> &mut AuditStamp {
    &mut o.audit
}

/// Registry with every tenant-scoped type the system persists.
pub fn default_registry() -> EntityRegistry {
    let mut registry = EntityRegistry::new();
    registry
        .register(
            EntityDescriptor::<FileRecord>::tenant_scoped(file_tenant, set_file_tenant)
                .with_audit(file_audit)
                .with_soft_delete(file_tombstone, file_tombstone_mut)
                .with_pii_fields(&["original_file_name"]),
        )
        .register(
            EntityDescriptor::<FeatureOverride>::tenant_scoped(
                override_tenant,
                set_override_tenant,
            )
            .with_audit(override_audit),
        );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_knows_files_and_overrides() {
        let registry = default_registry();
        let files = registry.descriptor::<FileRecord>().unwrap();
        assert!(files.is_tenant_scoped());
        assert!(files.supports_soft_delete());
        let overrides = registry.descriptor::<FeatureOverride>().unwrap();
        assert!(overrides.is_tenant_scoped());
        assert!(!overrides.supports_soft_delete());
        assert!(registry.contains_kind("file"));
        assert!(registry.contains_kind("feature_override"));
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let registry = EntityRegistry::new();
        let Err(err) = registry.descriptor::<FileRecord>() else {
            panic!("descriptor of an unregistered type");
        };
        assert!(matches!(err, GuardError::UnregisteredEntity("file")));
    }

    #[test]
    fn descriptor_debug_shows_capabilities() {
        let registry = default_registry();
        let files = format!("{:?}", registry.descriptor::<FileRecord>().unwrap());
        assert!(files.contains("tenant_scoped: true"), "{files}");
        assert!(files.contains("soft_delete: true"), "{files}");
        let global = format!("{:?}", EntityDescriptor::<FeatureOverride>::global());
        assert!(global.contains("tenant_scoped: false"), "{global}");
        assert!(global.contains("audited: false"), "{global}");
    }

    #[test]
    fn tenant_accessors() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let mut f = FileRecord::pending("b", "k", "n", "image/png", 1, None);
        assert_eq!(d.tenant_of(&f), None);
        let tenant = TenantId::generate();
        (d.tenant.as_ref().unwrap().set)(&mut f, tenant);
        assert_eq!(d.tenant_of(&f), Some(tenant));
        assert!(!d.is_deleted(&f));
    }
}
