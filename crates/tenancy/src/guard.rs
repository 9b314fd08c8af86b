use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use tenantry_core::{Actor, Entity, TenantId};
use tenantry_store::{ChangeOperation, Row, RowScope, RowStore, RowTransaction};

use crate::context::TenantContext;
use crate::error::GuardError;
use crate::filter::{TenantFilter, Visibility};
use crate::registry::{EntityDescriptor, EntityRegistry};
use crate::stages::{self, StagedWrite};

/// One write in a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingChange<E> {
    Insert(E),
    /// Replace the stored entity with this value, matched by id.
    Update(E),
    /// Delete by id. Soft-deletable types are tombstoned instead.
    Delete(String),
}

/// The only write path for registered entities.
///
/// A change set is committed in one transaction: every stage runs for every
/// change before the transaction commits, and any failure rolls the whole
/// set back.
#[derive(Clone)]
pub struct PersistenceGuard {
    store: Arc<dyn RowStore>,
    registry: Arc<EntityRegistry>,
}

impl std::fmt::Debug for PersistenceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGuard")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

struct Unit<'a, E> {
    descriptor: &'a EntityDescriptor<E>,
    tenant: Option<TenantId>,
    actor: Actor,
    now: DateTime<Utc>,
}

impl PersistenceGuard {
    pub fn new(store: Arc<dyn RowStore>, registry: Arc<EntityRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// The read filter for `ctx`.
    pub fn filter(&self, ctx: &dyn TenantContext) -> TenantFilter<'_> {
        TenantFilter::new(&self.registry, ctx.tenant())
    }

    /// Apply `changes` as one unit of work and return the persisted values.
    ///
    /// For a hard delete the returned value is the entity as it was before
    /// removal.
    #[instrument(skip_all, fields(kind = E::KIND, changes = changes.len()))]
    pub async fn commit<E: Entity>(
        &self,
        ctx: &dyn TenantContext,
        changes: Vec<PendingChange<E>>,
    ) -> Result<Vec<E>, GuardError> {
        let descriptor = self.registry.descriptor::<E>()?;
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let unit = Unit {
            descriptor,
            tenant: ctx.tenant(),
            actor: ctx.actor(),
            now: Utc::now(),
        };

        let mut tx = self.store.begin().await?;
        let mut persisted = Vec::with_capacity(changes.len());
        for change in changes {
            match apply(tx.as_mut(), &unit, change).await {
                Ok(entity) => persisted.push(entity),
                Err(e) => {
                    if e.is_integrity_violation() {
                        warn!(
                            tenant_id = ?unit.tenant,
                            actor = %unit.actor,
                            error = ?e,
                            "rejected tenant-scoped write"
                        );
                    }
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "rollback failed after rejected write");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await?;
        debug!(count = persisted.len(), "committed change set");
        Ok(persisted)
    }

    pub async fn insert<E: Entity>(&self, ctx: &dyn TenantContext, entity: E) -> Result<E, GuardError> {
        single(self.commit(ctx, vec![PendingChange::Insert(entity)]).await?)
    }

    pub async fn update<E: Entity>(&self, ctx: &dyn TenantContext, entity: E) -> Result<E, GuardError> {
        single(self.commit(ctx, vec![PendingChange::Update(entity)]).await?)
    }

    pub async fn delete<E: Entity>(&self, ctx: &dyn TenantContext, id: &str) -> Result<E, GuardError> {
        single(
            self.commit::<E>(ctx, vec![PendingChange::Delete(id.to_owned())])
                .await?,
        )
    }

    /// Fetch by id within the context tenant.
    pub async fn get<E: Entity>(
        &self,
        ctx: &dyn TenantContext,
        id: &str,
        visibility: Visibility,
    ) -> Result<Option<E>, GuardError> {
        let filter = self.filter(ctx);
        let Some(scope) = filter.scope::<E>()? else {
            return Ok(None);
        };
        let row = self.store.get(E::KIND, id, scope).await?;
        decode_admitted(&filter, scope, visibility, row)
    }

    /// Fetch by natural key within the context tenant.
    pub async fn find_by_natural_key<E: Entity>(
        &self,
        ctx: &dyn TenantContext,
        natural_key: &str,
        visibility: Visibility,
    ) -> Result<Option<E>, GuardError> {
        let filter = self.filter(ctx);
        let Some(scope) = filter.scope::<E>()? else {
            return Ok(None);
        };
        let row = self
            .store
            .find_by_natural_key(E::KIND, natural_key, scope)
            .await?;
        decode_admitted(&filter, scope, visibility, row)
    }

    /// Every entity of type `E` visible to the context, ordered by id.
    pub async fn list<E: Entity>(
        &self,
        ctx: &dyn TenantContext,
        visibility: Visibility,
    ) -> Result<Vec<E>, GuardError> {
        let Some(query) = self.filter(ctx).query::<E>(visibility)? else {
            return Ok(Vec::new());
        };
        self.store
            .list(&query)
            .await?
            .into_iter()
            .map(|row| decode(&row))
            .collect()
    }
}

async fn apply<E: Entity>(
    tx: &mut dyn RowTransaction,
    unit: &Unit<'_, E>,
    change: PendingChange<E>,
) -> Result<E, GuardError> {
    let mut write = match change {
        PendingChange::Insert(entity) => StagedWrite::insert(entity),
        PendingChange::Update(entity) => {
            let before = load::<E>(tx, &entity.id()).await?;
            StagedWrite::update(before, entity)
        }
        PendingChange::Delete(id) => StagedWrite::delete(load::<E>(tx, &id).await?),
    };

    stages::enforce_tenant(unit.descriptor, unit.tenant, &mut write)?;
    stages::convert_soft_delete(unit.descriptor, &unit.actor, unit.now, &mut write);
    stages::stamp_audit(unit.descriptor, &unit.actor, unit.now, &mut write);
    let entry = stages::change_entry(unit.descriptor, unit.tenant, &unit.actor, unit.now, &write)?;

    match (write.operation, write.after.as_ref()) {
        (ChangeOperation::Insert, Some(entity)) => {
            tx.insert(to_row(unit.descriptor, entity, unit.now)?).await?;
        }
        (ChangeOperation::Update | ChangeOperation::SoftDelete, Some(entity)) => {
            tx.update(to_row(unit.descriptor, entity, unit.now)?).await?;
        }
        _ => {
            tx.delete(E::KIND, &write.id).await?;
        }
    }
    tx.append_change(entry).await?;

    write
        .after
        .or(write.before)
        .ok_or_else(|| GuardError::NotFound {
            kind: E::KIND,
            id: write.id,
        })
}

async fn load<E: Entity>(tx: &mut dyn RowTransaction, id: &str) -> Result<E, GuardError> {
    let row = tx
        .fetch(E::KIND, id)
        .await?
        .ok_or_else(|| GuardError::NotFound {
            kind: E::KIND,
            id: id.to_owned(),
        })?;
    decode(&row)
}

fn to_row<E: Entity>(
    descriptor: &EntityDescriptor<E>,
    entity: &E,
    now: DateTime<Utc>,
) -> Result<Row, GuardError> {
    Ok(Row {
        kind: E::KIND.to_owned(),
        id: entity.id(),
        tenant_id: descriptor.tenant_of(entity),
        natural_key: entity.natural_key(),
        body: serde_json::to_value(entity)?,
        deleted: descriptor.is_deleted(entity),
        updated_at: now,
    })
}

fn decode<E: Entity>(row: &Row) -> Result<E, GuardError> {
    Ok(serde_json::from_value(row.body.clone())?)
}

fn decode_admitted<E: Entity>(
    filter: &TenantFilter<'_>,
    scope: RowScope,
    visibility: Visibility,
    row: Option<Row>,
) -> Result<Option<E>, GuardError> {
    row.filter(|r| filter.admits(scope, visibility, r))
        .map(|r| decode(&r))
        .transpose()
}

fn single<E>(mut persisted: Vec<E>) -> Result<E, GuardError> {
    persisted
        .pop()
        .ok_or(GuardError::Serialization("empty change set result".into()))
}

#[cfg(test)]
mod tests {
    use tenantry_core::FileRecord;
    use tenantry_store_memory::MemoryStore;

    use super::*;
    use crate::context::FixedTenantContext;
    use crate::registry::default_registry;

    fn guard() -> (PersistenceGuard, MemoryStore) {
        let store = MemoryStore::new();
        let guard = PersistenceGuard::new(Arc::new(store.clone()), Arc::new(default_registry()));
        (guard, store)
    }

    fn file(key: &str) -> FileRecord {
        FileRecord::pending("uploads", key, "scan.pdf", "application/pdf", 4, None)
    }

    #[tokio::test]
    async fn insert_assigns_tenant_and_stamps() {
        let (guard, _) = guard();
        let tenant = TenantId::generate();
        let ctx = FixedTenantContext::system(tenant);
        let stored = guard.insert(&ctx, file("k1")).await.unwrap();
        assert_eq!(stored.tenant_id, Some(tenant));
        assert_eq!(stored.audit.created_by.as_deref(), Some("system"));
        let read = guard
            .get::<FileRecord>(&ctx, &stored.id.to_string(), Visibility::Live)
            .await
            .unwrap();
        assert_eq!(read, Some(stored));
    }

    #[tokio::test]
    async fn failed_change_set_commits_nothing() {
        let (guard, store) = guard();
        let tenant = TenantId::generate();
        let ctx = FixedTenantContext::system(tenant);
        let mut foreign = file("k2");
        foreign.tenant_id = Some(TenantId::generate());
        let err = guard
            .commit(
                &ctx,
                vec![PendingChange::Insert(file("k1")), PendingChange::Insert(foreign)],
            )
            .await
            .unwrap_err();
        assert!(err.is_integrity_violation());
        assert!(guard.list::<FileRecord>(&ctx, Visibility::IncludeDeleted).await.unwrap().is_empty());
        assert!(store.change_log(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_then_delete_in_one_unit() {
        let (guard, store) = guard();
        let ctx = FixedTenantContext::system(TenantId::generate());
        let mut stored = guard.insert(&ctx, file("k1")).await.unwrap();
        let id = stored.id.to_string();
        stored
            .mark_infected(Some("Eicar".into()), None, Utc::now())
            .unwrap();
        let out = guard
            .commit(
                &ctx,
                vec![PendingChange::Update(stored), PendingChange::Delete(id.clone())],
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[1].tombstone.deleted);
        assert!(guard.get::<FileRecord>(&ctx, &id, Visibility::Live).await.unwrap().is_none());
        let hidden = guard
            .get::<FileRecord>(&ctx, &id, Visibility::IncludeDeleted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hidden.scan_result_details.as_deref(), Some("Eicar"));

        let ops: Vec<_> = store
            .change_log(None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.operation)
            .collect();
        assert_eq!(
            ops,
            vec![
                ChangeOperation::Insert,
                ChangeOperation::Update,
                ChangeOperation::SoftDelete
            ]
        );
    }

    #[tokio::test]
    async fn update_of_missing_entity_is_not_found() {
        let (guard, _) = guard();
        let ctx = FixedTenantContext::system(TenantId::generate());
        let err = guard.update(&ctx, file("k1")).await.unwrap_err();
        assert!(matches!(err, GuardError::NotFound { kind: "file", .. }));
    }
}
