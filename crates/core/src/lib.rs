pub mod billing;
pub mod entity;
pub mod error;
pub mod event;
pub mod file;
pub mod retry;
pub mod tenant;
pub mod types;
pub mod usage;
pub mod window;

pub use billing::{
    FeatureOverride, Plan, PlanFeature, QuotaUsage, Subscription, SubscriptionStatus,
};
pub use entity::{AuditStamp, Entity, Tombstone};
pub use error::CoreError;
pub use event::UploadScanEvent;
pub use file::{FileRecord, ScanStatus};
pub use retry::RetryStrategy;
pub use tenant::Tenant;
pub use types::{Actor, TenantId, UserId};
pub use usage::{Overage, UsageDaily, UsageEvent, UsagePeriod, metering};
pub use window::DayWindow;
