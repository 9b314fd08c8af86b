use thiserror::Error;

use tenantry_core::CoreError;
use tenantry_store::StoreError;

/// Errors raised by the persistence guard.
///
/// Integrity violations render without identifiers; `kind` and `id` are
/// kept for structured logging only.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A tenant-scoped write was attempted without a resolved tenant.
    #[error("no tenant context for a tenant-scoped write")]
    NoTenantContext,

    #[error("operation not permitted")]
    CrossTenantViolation { kind: &'static str, id: String },

    #[error("operation not permitted: tenant cannot be reassigned")]
    TenantReassignmentForbidden { kind: &'static str, id: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("entity kind not registered: {0}")]
    UnregisteredEntity(&'static str),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Domain(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GuardError {
    /// Whether retrying the unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Cross-tenant access or tenant reassignment.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Self::CrossTenantViolation { .. } | Self::TenantReassignmentForbidden { .. }
        )
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
