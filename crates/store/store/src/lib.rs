pub mod billing;
pub mod error;
pub mod lock;
pub mod metering;
pub mod row;
pub mod testing;

pub use billing::BillingStore;
pub use error::StoreError;
pub use lock::{DistributedLock, LockGuard};
pub use metering::{
    DailyRollupReport, InsertOutcome, MeteringStore, PeriodCloseReport, PeriodRollupReport,
};
pub use row::{ChangeLogEntry, ChangeOperation, Row, RowQuery, RowScope, RowStore, RowTransaction};
