use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Ownership of one named lock. A guard dropped without `release` keeps the
/// lock until its TTL runs out.
#[async_trait]
pub trait LockGuard: Send + Sync {
    /// Push the expiry to `duration` from now. Fails once the lock was lost.
    async fn extend(&self, duration: Duration) -> Result<(), StoreError>;

    async fn release(self: Box<Self>) -> Result<(), StoreError>;

    /// `false` after expiry or after another owner took the name over.
    async fn is_held(&self) -> Result<bool, StoreError>;
}

/// Cross-process mutual exclusion, used to keep a scheduled job from running
/// on two worker instances at once.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// `None` while another owner holds `name`.
    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockGuard>>, StoreError>;

    /// Poll for `name` until `timeout`, then fail with [`StoreError::Timeout`].
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Box<dyn LockGuard>, StoreError>;
}
