//! Per-tenant feature entitlements.
//!
//! [`EntitlementService`] merges a tenant's active plan features with its
//! overrides, overrides taking precedence until they expire. [`QuotaGate`]
//! counts gated requests per UTC day against those limits.

pub mod config;
pub mod error;
pub mod quota;
pub mod service;

pub use config::EntitlementConfig;
pub use error::EntitlementError;
pub use quota::{QUOTA_PREFIX, QuotaDecision, QuotaGate, QuotaRejection};
pub use service::{EntitlementService, EntitlementSet};
