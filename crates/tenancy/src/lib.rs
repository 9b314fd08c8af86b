//! Tenant isolation at the persistence boundary.
//!
//! Every write of a registered entity goes through [`PersistenceGuard`],
//! which runs a fixed sequence of stages over the pending change set inside
//! the same transaction as the write:
//!
//! 1. tenant enforcement ([`stages::enforce_tenant`])
//! 2. soft-delete conversion ([`stages::convert_soft_delete`])
//! 3. audit stamping ([`stages::stamp_audit`])
//! 4. change-log capture ([`stages::change_entry`])
//!
//! Reads are filtered by [`TenantFilter`], built from the same registry.

pub mod context;
pub mod error;
pub mod filter;
pub mod guard;
pub mod redact;
pub mod registry;
pub mod stages;

pub use context::{ClaimsTenantContext, FixedTenantContext, HeaderTenantContext, TenantContext};
pub use error::GuardError;
pub use filter::{TenantFilter, Visibility};
pub use guard::{PendingChange, PersistenceGuard};
pub use redact::Redactor;
pub use registry::{EntityDescriptor, EntityRegistry, default_registry};
pub use stages::StagedWrite;
