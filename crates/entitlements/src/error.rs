use thiserror::Error;

use tenantry_store::StoreError;
use tenantry_tenancy::GuardError;

/// Errors from resolving entitlements and gating quota.
#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("invalid override: {0}")]
    InvalidOverride(String),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A coalesced load failed in another caller; only its message survives.
    #[error("entitlement load failed: {0}")]
    Load(String),
}

impl EntitlementError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Guard(e) => e.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            Self::Load(_) => true,
            Self::InvalidOverride(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_cause() {
        assert!(EntitlementError::from(StoreError::Connection("refused".into())).is_retryable());
        assert!(!EntitlementError::InvalidOverride("negative limit".into()).is_retryable());
        assert!(!EntitlementError::from(GuardError::NoTenantContext).is_retryable());
    }
}
