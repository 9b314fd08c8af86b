use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use uuid::Uuid;

use tenantry_store::error::StoreError;
use tenantry_store::lock::{DistributedLock, LockGuard};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
struct Holder {
    owner: Uuid,
    expires_at: Instant,
}

impl Holder {
    fn live(self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Process-local [`DistributedLock`].
///
/// Only excludes tasks within one process; use the Postgres lock when more
/// than one worker instance runs the scheduler. Expired holders are
/// replaced on the next acquire.
#[derive(Debug, Clone, Default)]
pub struct MemoryDistributedLock {
    holders: Arc<DashMap<String, Holder>>,
}

impl MemoryDistributedLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for MemoryDistributedLock {
    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockGuard>>, StoreError> {
        let owner = Uuid::new_v4();
        let holder = Holder {
            owner,
            expires_at: Instant::now() + ttl,
        };
        match self.holders.entry(name.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    return Ok(None);
                }
                occupied.insert(holder);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
            }
        }
        Ok(Some(Box::new(MemoryLockGuard {
            holders: Arc::clone(&self.holders),
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
            if Instant::now() >= deadline {
                return Err(StoreError::Timeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Guard returned by [`MemoryDistributedLock`].
#[derive(Debug)]
pub struct MemoryLockGuard {
    holders: Arc<DashMap<String, Holder>>,
    name: String,
    owner: Uuid,
}

impl MemoryLockGuard {
    fn owns(&self, holder: Holder) -> bool {
        holder.owner == self.owner && holder.live()
    }
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    async fn extend(&self, duration: Duration) -> Result<(), StoreError> {
        match self.holders.get_mut(&self.name) {
            Some(mut holder) if self.owns(*holder) => {
                holder.expires_at = Instant::now() + duration;
                Ok(())
            }
            _ => Err(StoreError::LockExpired(self.name.clone())),
        }
    }

    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        self.holders
            .remove_if(&self.name, |_, holder| holder.owner == self.owner);
        Ok(())
    }

    async fn is_held(&self) -> Result<bool, StoreError> {
        Ok(self
            .holders
            .get(&self.name)
            .is_some_and(|holder| self.owns(*holder)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tenantry_store::testing::run_lock_conformance_tests;

    use super::*;

    #[tokio::test]
    async fn conformance() {
        let lock = MemoryDistributedLock::new();
        run_lock_conformance_tests(&lock)
            .await
            .expect("lock conformance tests should pass");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_holder_is_replaced() {
        let lock = MemoryDistributedLock::new();
        let stale = lock
            .try_acquire("job:daily-rollup", Duration::from_secs(2))
            .await
            .unwrap()
            .expect("should acquire");

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!stale.is_held().await.unwrap());
        assert!(matches!(
            stale.extend(Duration::from_secs(5)).await,
            Err(StoreError::LockExpired(_))
        ));

        let fresh = lock
            .try_acquire("job:daily-rollup", Duration::from_secs(10))
            .await
            .unwrap()
            .expect("expired lock should be acquirable");

        // A stale guard must not release the new holder's lock.
        stale.release().await.unwrap();
        assert!(fresh.is_held().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_expiry() {
        let lock = MemoryDistributedLock::new();
        let _held = lock
            .try_acquire("job:period-close", Duration::from_secs(1))
            .await
            .unwrap()
            .expect("should acquire");

        let waiter = lock.clone();
        let handle = tokio::spawn(async move {
            waiter
                .acquire("job:period-close", Duration::from_secs(5), Duration::from_secs(10))
                .await
        });
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn only_one_holder_at_a_time() {
        let lock = Arc::new(MemoryDistributedLock::new());
        let inside = Arc::new(AtomicU32::new(0));
        let completed = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let completed = Arc::clone(&completed);
            handles.push(tokio::spawn(async move {
                let guard = lock
                    .acquire("job:shared", Duration::from_secs(5), Duration::from_secs(5))
                    .await
                    .expect("should eventually acquire");
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
                guard.release().await.unwrap();
            }));
        }
        for h in handles {
            h.await.expect("task should not panic");
        }
        assert_eq!(completed.load(Ordering::SeqCst), 8);
    }
}
