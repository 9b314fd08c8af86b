//! The tenantry background worker.
//!
//! Consumes upload-scan events, optionally ingests bucket notifications, and
//! runs the usage aggregation jobs on their schedules. Backends are chosen in
//! [`WorkerConfig`]; Postgres and AWS need the `postgres` and `aws` features.

pub mod config;
pub mod error;
pub mod factory;
pub mod runner;
pub mod telemetry;

pub use config::WorkerConfig;
pub use error::WorkerError;
pub use runner::Worker;
