//! Daily per-feature request quotas.
//!
//! The gate reads today's counter and increments it when under the limit.
//! The read and the increment are separate statements, so two concurrent
//! requests can both pass at `limit - 1`: the cap is at least `limit`, not
//! exactly `limit`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use tenantry_core::{DayWindow, TenantId, window};
use tenantry_store::BillingStore;

use crate::config::EntitlementConfig;
use crate::error::EntitlementError;
use crate::service::EntitlementService;

/// Prefix of the entitlement that sets a feature's daily quota.
pub const QUOTA_PREFIX: &str = "quota.";

/// Machine-readable body for a request refused by the quota gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRejection {
    pub code: &'static str,
    pub feature: String,
    pub limit: i64,
    pub used: i64,
    /// Seconds until the counter resets at the next UTC midnight.
    pub retry_after_seconds: u64,
}

impl QuotaRejection {
    pub const CODE: &'static str = "quota_exceeded";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Counted; `used` includes this request.
    Allowed { limit: i64, used: i64 },
    /// No quota applies to the feature; nothing was counted.
    Unmetered,
    Rejected(QuotaRejection),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Gate for quota-limited requests.
#[derive(Clone)]
pub struct QuotaGate {
    entitlements: EntitlementService,
    billing: Arc<dyn BillingStore>,
    config: EntitlementConfig,
}

impl std::fmt::Debug for QuotaGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGate")
            .field("default_quotas", &self.config.default_quotas)
            .finish_non_exhaustive()
    }
}

impl QuotaGate {
    pub fn new(
        entitlements: EntitlementService,
        billing: Arc<dyn BillingStore>,
        config: EntitlementConfig,
    ) -> Self {
        Self {
            entitlements,
            billing,
            config,
        }
    }

    /// The daily quota for `feature`: the tenant's `quota.{feature}`
    /// entitlement, else the configured default.
    pub async fn limit_for(
        &self,
        tenant: TenantId,
        feature: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, EntitlementError> {
        let set = self.entitlements.entitlements(tenant).await?;
        Ok(set
            .limit_at(&format!("{QUOTA_PREFIX}{feature}"), now)
            .or_else(|| self.config.default_quotas.get(feature).copied()))
    }

    /// Resolve the tenant's quota for `feature` and gate one request.
    pub async fn check(
        &self,
        tenant: TenantId,
        feature: &str,
    ) -> Result<QuotaDecision, EntitlementError> {
        let now = Utc::now();
        match self.limit_for(tenant, feature, now).await? {
            Some(limit) => self.check_limit(tenant, feature, limit, now).await,
            None => Ok(QuotaDecision::Unmetered),
        }
    }

    /// Gate one request against an explicit `limit` for the day of `now`.
    #[instrument(skip(self, now), fields(tenant_id = %tenant))]
    pub async fn check_limit(
        &self,
        tenant: TenantId,
        feature: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, EntitlementError> {
        let today = now.date_naive();
        let used = self.billing.quota_usage(tenant, feature, today).await?;
        if used >= limit {
            info!(limit, used, "quota exceeded");
            return Ok(QuotaDecision::Rejected(QuotaRejection {
                code: QuotaRejection::CODE,
                feature: feature.to_owned(),
                limit,
                used,
                retry_after_seconds: window::seconds_until_next_day(&now),
            }));
        }
        let used = self
            .billing
            .increment_quota_usage(tenant, feature, DayWindow::single(today), 1)
            .await?;
        debug!(limit, used, "quota counted");
        Ok(QuotaDecision::Allowed { limit, used })
    }
}
