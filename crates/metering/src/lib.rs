//! Usage metering.
//!
//! [`MeteringRecorder`] appends usage events idempotently. The three
//! aggregation jobs fold them into daily rows, then billing periods, then
//! close elapsed periods with their overage charges. [`Scheduler`] runs the
//! jobs on cron schedules without letting a job overlap itself.

pub mod error;
pub mod jobs;
pub mod recorder;
pub mod scheduler;

pub use error::MeteringError;
pub use jobs::{DailyRollupJob, Job, JobKind, JobReport, PeriodCloseJob, PeriodRollupJob};
pub use recorder::{MeteringRecorder, UsageRecord};
pub use scheduler::{JobRun, Scheduler, SchedulerConfig};
