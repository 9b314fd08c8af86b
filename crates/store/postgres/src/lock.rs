use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use tenantry_store::error::StoreError;
use tenantry_store::lock::{DistributedLock, LockGuard};

use crate::config::PostgresConfig;
use crate::error::map_sqlx;
use crate::store::PostgresStore;

/// Retry interval when polling for lock acquisition.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Row-based [`DistributedLock`] in the `{prefix}locks` table.
///
/// An expired row is taken over in the same statement that would insert a
/// fresh one, so a crashed holder never blocks the next scheduler run for
/// longer than its TTL.
pub struct PostgresDistributedLock {
    pool: PgPool,
    config: Arc<PostgresConfig>,
}

impl PostgresDistributedLock {
    /// Share the pool and table layout of an existing store. The store has
    /// already run migrations.
    pub fn from_store(store: &PostgresStore) -> Self {
        Self {
            pool: store.pool.clone(),
            config: Arc::clone(&store.config),
        }
    }
}

#[async_trait]
impl DistributedLock for PostgresDistributedLock {
    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockGuard>>, StoreError> {
        let table = self.config.locks_table();
        let owner = Uuid::new_v4().to_string();
        let expires_at = chrono::Utc::now() + ttl;

        let query = format!(
            "INSERT INTO {table} AS l (name, owner, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE \
             SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at \
             WHERE l.expires_at <= NOW()"
        );
        let result = sqlx::query(&query)
            .bind(name)
            .bind(&owner)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(Box::new(PostgresLockGuard {
            pool: self.pool.clone(),
            config: Arc::clone(&self.config),
            name: name.to_owned(),
            owner,
        })))
    }

    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Box<dyn LockGuard>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(guard) = self.try_acquire(name, ttl).await? {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Timeout(timeout));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// A held lock row. Dropping without release leaves the row to expire.
pub struct PostgresLockGuard {
    pool: PgPool,
    config: Arc<PostgresConfig>,
    name: String,
    owner: String,
}

#[async_trait]
impl LockGuard for PostgresLockGuard {
    async fn extend(&self, duration: Duration) -> Result<(), StoreError> {
        let table = self.config.locks_table();
        let query = format!(
            "UPDATE {table} SET expires_at = $1 \
             WHERE name = $2 AND owner = $3 AND expires_at > NOW()"
        );
        let result = sqlx::query(&query)
            .bind(chrono::Utc::now() + duration)
            .bind(&self.name)
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::LockExpired(self.name.clone()));
        }
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        let table = self.config.locks_table();
        let query = format!("DELETE FROM {table} WHERE name = $1 AND owner = $2");
        sqlx::query(&query)
            .bind(&self.name)
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn is_held(&self) -> Result<bool, StoreError> {
        let table = self.config.locks_table();
        let query = format!(
            "SELECT 1 FROM {table} WHERE name = $1 AND owner = $2 AND expires_at > NOW()"
        );
        let row: Option<(i32,)> = sqlx::query_as(&query)
            .bind(&self.name)
            .bind(&self.owner)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn lock_conformance() {
        let config = PostgresConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/tenantry_test".to_string()),
            table_prefix: format!("test_{}_", Uuid::new_v4().simple()),
            ..PostgresConfig::default()
        };
        let store = PostgresStore::new(config)
            .await
            .expect("pool creation should succeed");
        let lock = PostgresDistributedLock::from_store(&store);
        tenantry_store::testing::run_lock_conformance_tests(&lock)
            .await
            .expect("lock conformance tests should pass");
    }
}
