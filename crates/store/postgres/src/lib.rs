mod billing;
mod config;
mod error;
mod lock;
mod metering;
mod migrations;
mod rows;
mod store;

pub use config::PostgresConfig;
pub use lock::{PostgresDistributedLock, PostgresLockGuard};
pub use migrations::run_migrations;
pub use rows::PostgresTransaction;
pub use store::PostgresStore;
