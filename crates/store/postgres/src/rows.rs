use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row as _, Transaction};
use uuid::Uuid;

use tenantry_core::TenantId;
use tenantry_store::error::StoreError;
use tenantry_store::row::{
    ChangeLogEntry, ChangeOperation, Row, RowQuery, RowScope, RowStore, RowTransaction,
};

use crate::config::PostgresConfig;
use crate::error::map_sqlx;
use crate::store::PostgresStore;

const ROW_COLUMNS: &str = "kind, id, tenant_id, natural_key, body, deleted, updated_at";

fn decode_row(r: &PgRow) -> Result<Row, StoreError> {
    let tenant: Option<Uuid> = r.try_get("tenant_id").map_err(map_sqlx)?;
    Ok(Row {
        kind: r.try_get("kind").map_err(map_sqlx)?,
        id: r.try_get("id").map_err(map_sqlx)?,
        tenant_id: tenant.map(TenantId::from),
        natural_key: r.try_get("natural_key").map_err(map_sqlx)?,
        body: r.try_get("body").map_err(map_sqlx)?,
        deleted: r.try_get("deleted").map_err(map_sqlx)?,
        updated_at: r.try_get("updated_at").map_err(map_sqlx)?,
    })
}

fn decode_change(r: &PgRow) -> Result<ChangeLogEntry, StoreError> {
    let tenant: Option<Uuid> = r.try_get("tenant_id").map_err(map_sqlx)?;
    let operation: String = r.try_get("operation").map_err(map_sqlx)?;
    Ok(ChangeLogEntry {
        id: r.try_get("id").map_err(map_sqlx)?,
        tenant_id: tenant.map(TenantId::from),
        entity_kind: r.try_get("entity_kind").map_err(map_sqlx)?,
        entity_id: r.try_get("entity_id").map_err(map_sqlx)?,
        operation: ChangeOperation::parse(&operation).ok_or_else(|| {
            StoreError::Serialization(format!("unknown change operation: {operation}"))
        })?,
        old_values: r.try_get("old_values").map_err(map_sqlx)?,
        new_values: r.try_get("new_values").map_err(map_sqlx)?,
        actor: r.try_get("actor").map_err(map_sqlx)?,
        at: r.try_get("at").map_err(map_sqlx)?,
    })
}

fn scope_tenant(scope: RowScope) -> Option<Uuid> {
    match scope {
        RowScope::AllTenants => None,
        RowScope::Tenant(tenant) => Some(tenant.into()),
    }
}

/// A database transaction. Dropping it rolls back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    config: Arc<PostgresConfig>,
}

#[async_trait]
impl RowTransaction for PostgresTransaction {
    async fn fetch(&mut self, kind: &str, id: &str) -> Result<Option<Row>, StoreError> {
        let table = self.config.rows_table();
        let query =
            format!("SELECT {ROW_COLUMNS} FROM {table} WHERE kind = $1 AND id = $2 FOR UPDATE");
        let row = sqlx::query(&query)
            .bind(kind)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn insert(&mut self, row: Row) -> Result<(), StoreError> {
        let table = self.config.rows_table();
        let query = format!(
            "INSERT INTO {table} ({ROW_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        );
        sqlx::query(&query)
            .bind(&row.kind)
            .bind(&row.id)
            .bind(row.tenant_id.map(Uuid::from))
            .bind(&row.natural_key)
            .bind(&row.body)
            .bind(row.deleted)
            .bind(row.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update(&mut self, row: Row) -> Result<(), StoreError> {
        let table = self.config.rows_table();
        let query = format!(
            "UPDATE {table} \
             SET tenant_id = $3, natural_key = $4, body = $5, deleted = $6, updated_at = $7 \
             WHERE kind = $1 AND id = $2"
        );
        let result = sqlx::query(&query)
            .bind(&row.kind)
            .bind(&row.id)
            .bind(row.tenant_id.map(Uuid::from))
            .bind(&row.natural_key)
            .bind(&row.body)
            .bind(row.deleted)
            .bind(row.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(row.kind, row.id));
        }
        Ok(())
    }

    async fn delete(&mut self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let table = self.config.rows_table();
        let query = format!("DELETE FROM {table} WHERE kind = $1 AND id = $2");
        let result = sqlx::query(&query)
            .bind(kind)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_change(&mut self, entry: ChangeLogEntry) -> Result<(), StoreError> {
        let table = self.config.change_log_table();
        let query = format!(
            "INSERT INTO {table} \
             (id, tenant_id, entity_kind, entity_id, operation, old_values, new_values, actor, at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        sqlx::query(&query)
            .bind(entry.id)
            .bind(entry.tenant_id.map(Uuid::from))
            .bind(&entry.entity_kind)
            .bind(&entry.entity_id)
            .bind(entry.operation.as_str())
            .bind(&entry.old_values)
            .bind(&entry.new_values)
            .bind(&entry.actor)
            .bind(entry.at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_sqlx)
    }
}

#[async_trait]
impl RowStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn RowTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_sqlx)?;
        Ok(Box::new(PostgresTransaction {
            tx,
            config: Arc::clone(&self.config),
        }))
    }

    async fn get(&self, kind: &str, id: &str, scope: RowScope) -> Result<Option<Row>, StoreError> {
        let table = self.config.rows_table();
        let query = format!(
            "SELECT {ROW_COLUMNS} FROM {table} \
             WHERE kind = $1 AND id = $2 AND ($3::uuid IS NULL OR tenant_id = $3)"
        );
        let row = sqlx::query(&query)
            .bind(kind)
            .bind(id)
            .bind(scope_tenant(scope))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn find_by_natural_key(
        &self,
        kind: &str,
        natural_key: &str,
        scope: RowScope,
    ) -> Result<Option<Row>, StoreError> {
        let table = self.config.rows_table();
        let query = format!(
            "SELECT {ROW_COLUMNS} FROM {table} \
             WHERE kind = $1 AND natural_key = $2 AND ($3::uuid IS NULL OR tenant_id = $3)"
        );
        let row = sqlx::query(&query)
            .bind(kind)
            .bind(natural_key)
            .bind(scope_tenant(scope))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn list(&self, query: &RowQuery) -> Result<Vec<Row>, StoreError> {
        let table = self.config.rows_table();
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {table} \
             WHERE kind = $1 AND ($2::uuid IS NULL OR tenant_id = $2) AND ($3 OR NOT deleted) \
             ORDER BY id LIMIT $4"
        );
        let limit = query.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(&sql)
            .bind(&query.kind)
            .bind(scope_tenant(query.scope))
            .bind(query.include_deleted)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_row).collect()
    }

    async fn change_log(
        &self,
        tenant: Option<TenantId>,
    ) -> Result<Vec<ChangeLogEntry>, StoreError> {
        let table = self.config.change_log_table();
        let query = format!(
            "SELECT id, tenant_id, entity_kind, entity_id, operation, old_values, new_values, actor, at \
             FROM {table} WHERE ($1::uuid IS NULL OR tenant_id = $1) ORDER BY seq"
        );
        let rows = sqlx::query(&query)
            .bind(tenant.map(Uuid::from))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_change).collect()
    }
}
