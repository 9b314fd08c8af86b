use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for [`EntitlementService`](crate::EntitlementService) and
/// [`QuotaGate`](crate::QuotaGate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementConfig {
    /// How long a tenant's resolved limits are served from cache.
    pub cache_ttl_seconds: u64,
    /// Tenants kept in cache at most.
    pub cache_capacity: u64,
    /// Daily quota per gated feature when the tenant has no
    /// `quota.{feature}` entitlement. Features absent here are ungated.
    pub default_quotas: HashMap<String, i64>,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 60,
            cache_capacity: 10_000,
            default_quotas: HashMap::new(),
        }
    }
}

impl EntitlementConfig {
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_seconds = ttl.as_secs().max(1);
        self
    }

    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_default_quota(mut self, feature: impl Into<String>, limit: i64) -> Self {
        self.default_quotas.insert(feature.into(), limit);
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds.max(1))
    }
}
