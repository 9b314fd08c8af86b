use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use tenantry_core::TenantId;
use tenantry_store::error::StoreError;
use tenantry_store::row::{ChangeLogEntry, Row, RowQuery, RowScope, RowStore, RowTransaction};

use crate::MemoryStore;

type RowKey = (String, String);

/// Committed rows plus the natural-key index and the change log.
#[derive(Debug, Clone, Default)]
pub(crate) struct RowTables {
    rows: BTreeMap<RowKey, Row>,
    natural: HashMap<RowKey, String>,
    change_log: Vec<ChangeLogEntry>,
}

impl RowTables {
    fn get(&self, kind: &str, id: &str) -> Option<&Row> {
        self.rows.get(&(kind.to_owned(), id.to_owned()))
    }

    fn apply(&mut self, op: &Op) -> Result<bool, StoreError> {
        match op {
            Op::Insert(row) => {
                let key = (row.kind.clone(), row.id.clone());
                if self.rows.contains_key(&key) {
                    return Err(StoreError::UniqueViolation(format!(
                        "{} id {}",
                        row.kind, row.id
                    )));
                }
                if let Some(nk) = &row.natural_key {
                    let nk_key = (row.kind.clone(), nk.clone());
                    if self.natural.contains_key(&nk_key) {
                        return Err(StoreError::UniqueViolation(format!(
                            "{} natural key {nk}",
                            row.kind
                        )));
                    }
                    self.natural.insert(nk_key, row.id.clone());
                }
                self.rows.insert(key, row.clone());
                Ok(true)
            }
            Op::Update(row) => {
                let key = (row.kind.clone(), row.id.clone());
                let Some(existing) = self.rows.get(&key) else {
                    return Err(StoreError::not_found(&row.kind, &row.id));
                };
                if existing.natural_key != row.natural_key {
                    if let Some(nk) = &row.natural_key {
                        let nk_key = (row.kind.clone(), nk.clone());
                        if self.natural.get(&nk_key).is_some_and(|id| *id != row.id) {
                            return Err(StoreError::UniqueViolation(format!(
                                "{} natural key {nk}",
                                row.kind
                            )));
                        }
                    }
                    if let Some(old) = &existing.natural_key {
                        self.natural.remove(&(row.kind.clone(), old.clone()));
                    }
                    if let Some(nk) = &row.natural_key {
                        self.natural
                            .insert((row.kind.clone(), nk.clone()), row.id.clone());
                    }
                }
                self.rows.insert(key, row.clone());
                Ok(true)
            }
            Op::Delete { kind, id } => {
                let Some(removed) = self.rows.remove(&(kind.clone(), id.clone())) else {
                    return Ok(false);
                };
                if let Some(nk) = removed.natural_key {
                    self.natural.remove(&(kind.clone(), nk));
                }
                Ok(true)
            }
            Op::Change(entry) => {
                self.change_log.push(entry.clone());
                Ok(true)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert(Row),
    Update(Row),
    Delete { kind: String, id: String },
    Change(ChangeLogEntry),
}

/// A unit of work against a [`MemoryStore`].
///
/// Writes are applied to a private snapshot as they happen, so constraint
/// errors surface immediately. On commit the same operations are replayed
/// against the current committed tables under the lock. A replayed insert
/// that now collides on id or natural key, or an update of a row deleted in
/// the meantime, fails the whole transaction and nothing is written.
///
/// Updates carry no version check: when two transactions update the same
/// row, the later commit wins, as with the Postgres backend.
#[derive(Debug)]
pub struct MemoryTransaction {
    committed: Arc<Mutex<RowTables>>,
    snapshot: RowTables,
    ops: Vec<Op>,
}

impl MemoryTransaction {
    fn record(&mut self, op: Op) -> Result<bool, StoreError> {
        let applied = self.snapshot.apply(&op)?;
        self.ops.push(op);
        Ok(applied)
    }
}

#[async_trait]
impl RowTransaction for MemoryTransaction {
    async fn fetch(&mut self, kind: &str, id: &str) -> Result<Option<Row>, StoreError> {
        Ok(self.snapshot.get(kind, id).cloned())
    }

    async fn insert(&mut self, row: Row) -> Result<(), StoreError> {
        self.record(Op::Insert(row)).map(|_| ())
    }

    async fn update(&mut self, row: Row) -> Result<(), StoreError> {
        self.record(Op::Update(row)).map(|_| ())
    }

    async fn delete(&mut self, kind: &str, id: &str) -> Result<bool, StoreError> {
        self.record(Op::Delete {
            kind: kind.to_owned(),
            id: id.to_owned(),
        })
    }

    async fn append_change(&mut self, entry: ChangeLogEntry) -> Result<(), StoreError> {
        self.record(Op::Change(entry)).map(|_| ())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut committed = self.committed.lock();
        let mut next = committed.clone();
        for op in &self.ops {
            next.apply(op)?;
        }
        *committed = next;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn RowTransaction>, StoreError> {
        let snapshot = self.rows.lock().clone();
        Ok(Box::new(MemoryTransaction {
            committed: Arc::clone(&self.rows),
            snapshot,
            ops: Vec::new(),
        }))
    }

    async fn get(&self, kind: &str, id: &str, scope: RowScope) -> Result<Option<Row>, StoreError> {
        let tables = self.rows.lock();
        Ok(tables.get(kind, id).filter(|r| scope.admits(r)).cloned())
    }

    async fn find_by_natural_key(
        &self,
        kind: &str,
        natural_key: &str,
        scope: RowScope,
    ) -> Result<Option<Row>, StoreError> {
        let tables = self.rows.lock();
        let row = tables
            .natural
            .get(&(kind.to_owned(), natural_key.to_owned()))
            .and_then(|id| tables.get(kind, id))
            .filter(|r| scope.admits(r))
            .cloned();
        Ok(row)
    }

    async fn list(&self, query: &RowQuery) -> Result<Vec<Row>, StoreError> {
        let tables = self.rows.lock();
        let rows = tables
            .rows
            .range((query.kind.clone(), String::new())..)
            .take_while(|((kind, _), _)| *kind == query.kind)
            .map(|(_, row)| row)
            .filter(|r| query.scope.admits(r))
            .filter(|r| query.include_deleted || !r.deleted)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn change_log(
        &self,
        tenant: Option<TenantId>,
    ) -> Result<Vec<ChangeLogEntry>, StoreError> {
        let tables = self.rows.lock();
        Ok(tables
            .change_log
            .iter()
            .filter(|e| tenant.is_none() || e.tenant_id == tenant)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tenantry_store::testing::run_row_store_conformance_tests;

    use super::*;

    fn row(id: &str, nk: Option<&str>) -> Row {
        Row {
            kind: "item".into(),
            id: id.into(),
            tenant_id: Some(TenantId::generate()),
            natural_key: nk.map(str::to_owned),
            body: serde_json::json!({}),
            deleted: false,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn conformance() {
        let store = MemoryStore::new();
        run_row_store_conformance_tests(&store)
            .await
            .expect("row store conformance tests should pass");
    }

    #[tokio::test]
    async fn concurrent_commit_conflict_writes_nothing() {
        let store = MemoryStore::new();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.insert(row("a", Some("shared"))).await.unwrap();
        second.insert(row("b", Some("shared"))).await.unwrap();
        second
            .append_change(ChangeLogEntry {
                id: uuid::Uuid::now_v7(),
                tenant_id: None,
                entity_kind: "item".into(),
                entity_id: "b".into(),
                operation: tenantry_store::ChangeOperation::Insert,
                old_values: None,
                new_values: None,
                actor: "system".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        assert!(store.get("item", "b", RowScope::AllTenants).await.unwrap().is_none());
        assert!(store.change_log(None).await.unwrap().is_empty());
    }

    async fn committed(store: &MemoryStore, id: &str) -> Row {
        store.get("item", id, RowScope::AllTenants).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn concurrent_updates_of_one_row_keep_the_later_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(row("a", None)).await.unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let mut by_first = first.fetch("item", "a").await.unwrap().unwrap();
        let mut by_second = second.fetch("item", "a").await.unwrap().unwrap();
        by_first.body = serde_json::json!({ "writer": "first" });
        by_second.body = serde_json::json!({ "writer": "second" });
        first.update(by_first).await.unwrap();
        second.update(by_second).await.unwrap();

        second.commit().await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(committed(&store, "a").await.body["writer"], "first");
    }

    #[tokio::test]
    async fn update_of_concurrently_deleted_row_writes_nothing() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(row("a", None)).await.unwrap();
        tx.commit().await.unwrap();

        let mut updater = store.begin().await.unwrap();
        let mut deleter = store.begin().await.unwrap();
        let mut edited = updater.fetch("item", "a").await.unwrap().unwrap();
        edited.body = serde_json::json!({ "edited": true });
        updater.update(edited).await.unwrap();
        updater.insert(row("b", None)).await.unwrap();
        assert!(deleter.delete("item", "a").await.unwrap());

        deleter.commit().await.unwrap();
        let err = updater.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.get("item", "a", RowScope::AllTenants).await.unwrap().is_none());
        assert!(store.get("item", "b", RowScope::AllTenants).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_moves_natural_key() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(row("a", Some("old"))).await.unwrap();
        tx.commit().await.unwrap();

        let mut moved = committed(&store, "a").await;
        moved.natural_key = Some("new".into());
        let mut tx = store.begin().await.unwrap();
        tx.update(moved).await.unwrap();
        tx.commit().await.unwrap();

        let scope = RowScope::AllTenants;
        assert!(store.find_by_natural_key("item", "old", scope).await.unwrap().is_none());
        assert!(store.find_by_natural_key("item", "new", scope).await.unwrap().is_some());
    }
}
