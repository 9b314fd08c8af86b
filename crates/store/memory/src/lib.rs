//! In-memory backends for every store trait.
//!
//! Suitable for tests and single-process development. State is lost when
//! the process exits.

mod billing;
mod lock;
mod metering;
mod rows;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub use lock::{MemoryDistributedLock, MemoryLockGuard};
pub use rows::MemoryTransaction;

/// In-memory implementation of [`RowStore`](tenantry_store::RowStore),
/// [`MeteringStore`](tenantry_store::MeteringStore) and
/// [`BillingStore`](tenantry_store::BillingStore).
///
/// Clones share the same underlying tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<rows::RowTables>>,
    metering: Arc<Mutex<metering::MeteringTables>>,
    billing: Arc<RwLock<billing::BillingTables>>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}
