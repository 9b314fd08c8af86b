//! Pre-commit stages applied to each pending write.
//!
//! Each stage is a plain function over one [`StagedWrite`], so it can be
//! tested without a store. The guard runs them in the order they appear in
//! this module.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use tenantry_core::{Actor, Entity, TenantId};
use tenantry_store::{ChangeLogEntry, ChangeOperation};

use crate::error::GuardError;
use crate::registry::EntityDescriptor;

/// One write with its stored predecessor, as it moves through the stages.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite<E> {
    pub operation: ChangeOperation,
    pub id: String,
    /// The row as last committed, read inside the write's transaction.
    pub before: Option<E>,
    /// The value to persist. `None` removes the row.
    pub after: Option<E>,
}

impl<E: Entity> StagedWrite<E> {
    pub fn insert(entity: E) -> Self {
        Self {
            operation: ChangeOperation::Insert,
            id: entity.id(),
            before: None,
            after: Some(entity),
        }
    }

    pub fn update(before: E, entity: E) -> Self {
        Self {
            operation: ChangeOperation::Update,
            id: entity.id(),
            before: Some(before),
            after: Some(entity),
        }
    }

    pub fn delete(before: E) -> Self {
        Self {
            operation: ChangeOperation::Delete,
            id: before.id(),
            before: Some(before),
            after: None,
        }
    }
}

/// Assign or verify tenant ownership.
///
/// Inserts take the context tenant when unset. Updates and deletes are
/// checked against the stored owner, never against what the caller sent;
/// an update that changes the tenant field in any way is refused.
pub fn enforce_tenant<E: Entity>(
    descriptor: &EntityDescriptor<E>,
    context_tenant: Option<TenantId>,
    write: &mut StagedWrite<E>,
) -> Result<(), GuardError> {
    let Some(field) = descriptor.tenant.as_ref() else {
        return Ok(());
    };
    let tenant = context_tenant.ok_or(GuardError::NoTenantContext)?;
    let cross_tenant = || GuardError::CrossTenantViolation {
        kind: E::KIND,
        id: write.id.clone(),
    };

    match write.operation {
        ChangeOperation::Insert => {
            let entity = write.after.as_mut().ok_or_else(cross_tenant)?;
            match (field.get)(entity) {
                None => (field.set)(entity, tenant),
                Some(owner) if owner == tenant => {}
                Some(_) => return Err(cross_tenant()),
            }
        }
        ChangeOperation::Update | ChangeOperation::Delete | ChangeOperation::SoftDelete => {
            let stored = write.before.as_ref().and_then(|b| (field.get)(b));
            if stored != Some(tenant) {
                return Err(cross_tenant());
            }
            if let Some(entity) = write.after.as_ref() {
                if (field.get)(entity) != stored {
                    return Err(GuardError::TenantReassignmentForbidden {
                        kind: E::KIND,
                        id: write.id.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Turn a delete of a soft-deletable type into a tombstoning update.
pub fn convert_soft_delete<E: Entity>(
    descriptor: &EntityDescriptor<E>,
    actor: &Actor,
    now: DateTime<Utc>,
    write: &mut StagedWrite<E>,
) {
    let Some(field) = descriptor.tombstone.as_ref() else {
        return;
    };
    if write.operation != ChangeOperation::Delete {
        return;
    }
    if let Some(before) = write.before.as_ref() {
        let mut tombstoned = before.clone();
        (field.get_mut)(&mut tombstoned).mark(&actor.audit_name(), now);
        write.after = Some(tombstoned);
        write.operation = ChangeOperation::SoftDelete;
    }
}

/// Stamp creation and modification fields.
///
/// Creation stamps are always carried over from the stored row on update,
/// so callers cannot rewrite them.
pub fn stamp_audit<E: Entity>(
    descriptor: &EntityDescriptor<E>,
    actor: &Actor,
    now: DateTime<Utc>,
    write: &mut StagedWrite<E>,
) {
    let Some(audit_of) = descriptor.audit else {
        return;
    };
    let name = actor.audit_name();
    let created = write.before.clone().map(|mut b| {
        let stamp = audit_of(&mut b);
        (stamp.created_at, stamp.created_by.clone())
    });
    let Some(entity) = write.after.as_mut() else {
        return;
    };
    let stamp = audit_of(entity);
    match (write.operation, created) {
        (ChangeOperation::Insert, _) | (_, None) => {
            stamp.created_at = Some(now);
            stamp.created_by = Some(name.clone());
        }
        (_, Some((created_at, created_by))) => {
            stamp.created_at = created_at;
            stamp.created_by = created_by;
        }
    }
    stamp.modified_at = Some(now);
    stamp.modified_by = Some(name);
}

/// Build the change-log entry for a write, with PII masked.
pub fn change_entry<E: Entity>(
    descriptor: &EntityDescriptor<E>,
    tenant: Option<TenantId>,
    actor: &Actor,
    now: DateTime<Utc>,
    write: &StagedWrite<E>,
) -> Result<ChangeLogEntry, GuardError> {
    let snapshot = |entity: Option<&E>| -> Result<Option<serde_json::Value>, GuardError> {
        entity
            .map(|e| {
                let mut value = serde_json::to_value(e)?;
                descriptor.redactor.redact(&mut value);
                Ok(value)
            })
            .transpose()
    };
    Ok(ChangeLogEntry {
        id: Uuid::now_v7(),
        tenant_id: descriptor.tenant.as_ref().and(tenant),
        entity_kind: E::KIND.to_owned(),
        entity_id: write.id.clone(),
        operation: write.operation,
        old_values: snapshot(write.before.as_ref())?,
        new_values: snapshot(write.after.as_ref())?,
        actor: actor.audit_name(),
        at: now,
    })
}

#[cfg(test)]
mod tests {
    use tenantry_core::{FeatureOverride, FileRecord, UserId};

    use super::*;
    use crate::registry::default_registry;

    fn file(tenant: Option<TenantId>) -> FileRecord {
        let mut f = FileRecord::pending("b", "tenants/x/1/a.pdf", "a.pdf", "application/pdf", 3, None);
        f.tenant_id = tenant;
        f
    }

    #[test]
    fn insert_assigns_context_tenant() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let tenant = TenantId::generate();
        let mut w = StagedWrite::insert(file(None));
        enforce_tenant(d, Some(tenant), &mut w).unwrap();
        assert_eq!(w.after.unwrap().tenant_id, Some(tenant));
    }

    #[test]
    fn insert_for_other_tenant_is_refused() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let mut w = StagedWrite::insert(file(Some(TenantId::generate())));
        let err = enforce_tenant(d, Some(TenantId::generate()), &mut w).unwrap_err();
        assert!(matches!(err, GuardError::CrossTenantViolation { kind: "file", .. }));
    }

    #[test]
    fn empty_context_fails_fast() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let mut w = StagedWrite::insert(file(None));
        assert!(matches!(
            enforce_tenant(d, None, &mut w),
            Err(GuardError::NoTenantContext)
        ));
    }

    #[test]
    fn update_checks_stored_owner_not_payload() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let owner = TenantId::generate();
        let intruder = TenantId::generate();
        let stored = file(Some(owner));
        // The payload claims the intruder's tenant to match the context.
        let mut forged = stored.clone();
        forged.tenant_id = Some(intruder);
        let mut w = StagedWrite::update(stored, forged);
        let err = enforce_tenant(d, Some(intruder), &mut w).unwrap_err();
        assert!(matches!(err, GuardError::CrossTenantViolation { .. }));
    }

    #[test]
    fn any_tenant_change_is_reassignment() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let owner = TenantId::generate();
        let stored = file(Some(owner));
        for new_value in [Some(TenantId::generate()), None] {
            let mut changed = stored.clone();
            changed.tenant_id = new_value;
            let mut w = StagedWrite::update(stored.clone(), changed);
            let err = enforce_tenant(d, Some(owner), &mut w).unwrap_err();
            assert!(matches!(err, GuardError::TenantReassignmentForbidden { .. }));
        }
    }

    #[test]
    fn delete_checks_stored_owner() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let mut w = StagedWrite::delete(file(Some(TenantId::generate())));
        let err = enforce_tenant(d, Some(TenantId::generate()), &mut w).unwrap_err();
        assert!(matches!(err, GuardError::CrossTenantViolation { .. }));
    }

    #[test]
    fn soft_delete_conversion_tombstones() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let now = Utc::now();
        let mut w = StagedWrite::delete(file(Some(TenantId::generate())));
        convert_soft_delete(d, &Actor::System, now, &mut w);
        assert_eq!(w.operation, ChangeOperation::SoftDelete);
        let after = w.after.unwrap();
        assert!(after.tombstone.deleted);
        assert_eq!(after.tombstone.deleted_by.as_deref(), Some("system"));
        assert_eq!(after.tombstone.deleted_at, Some(now));
    }

    #[test]
    fn hard_delete_types_stay_hard() {
        let registry = default_registry();
        let d = registry.descriptor::<FeatureOverride>().unwrap();
        let mut w = StagedWrite::delete(FeatureOverride::new("seats", 5));
        convert_soft_delete(d, &Actor::System, Utc::now(), &mut w);
        assert_eq!(w.operation, ChangeOperation::Delete);
        assert!(w.after.is_none());
    }

    #[test]
    fn audit_preserves_creation_stamp() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let creator = Actor::User(UserId::generate());
        let t0 = Utc::now();
        let mut w = StagedWrite::insert(file(None));
        stamp_audit(d, &creator, t0, &mut w);
        let stored = w.after.unwrap();
        assert_eq!(stored.audit.created_at, Some(t0));

        let mut forged = stored.clone();
        forged.audit.created_by = Some("mallory".into());
        let t1 = t0 + chrono::Duration::seconds(30);
        let mut w = StagedWrite::update(stored, forged);
        stamp_audit(d, &Actor::System, t1, &mut w);
        let updated = w.after.unwrap();
        assert_eq!(updated.audit.created_by, Some(creator.audit_name()));
        assert_eq!(updated.audit.created_at, Some(t0));
        assert_eq!(updated.audit.modified_by.as_deref(), Some("system"));
        assert_eq!(updated.audit.modified_at, Some(t1));
    }

    #[test]
    fn change_entry_masks_pii() {
        let registry = default_registry();
        let d = registry.descriptor::<FileRecord>().unwrap();
        let tenant = TenantId::generate();
        let w = StagedWrite::insert(file(Some(tenant)));
        let entry = change_entry(d, Some(tenant), &Actor::System, Utc::now(), &w).unwrap();
        assert_eq!(entry.operation, ChangeOperation::Insert);
        assert_eq!(entry.tenant_id, Some(tenant));
        assert!(entry.old_values.is_none());
        let new_values = entry.new_values.unwrap();
        assert_eq!(new_values["original_file_name"], crate::redact::MASK);
        assert_eq!(new_values["content_type"], "application/pdf");
    }
}
