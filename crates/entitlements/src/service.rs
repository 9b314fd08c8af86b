//! Effective per-tenant feature limits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use tracing::{debug, info, instrument};

use tenantry_core::{FeatureOverride, TenantId};
use tenantry_store::BillingStore;
use tenantry_tenancy::{
    FixedTenantContext, GuardError, PersistenceGuard, TenantContext, Visibility,
};

use crate::config::EntitlementConfig;
use crate::error::EntitlementError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct OverrideLimit {
    limit: i64,
    expires_at: Option<DateTime<Utc>>,
}

/// A tenant's plan limits and overrides as loaded from storage.
///
/// Override expiry is checked on every read, so a cached set never serves
/// an override past its expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitlementSet {
    plan: HashMap<String, i64>,
    overrides: HashMap<String, OverrideLimit>,
}

impl EntitlementSet {
    /// The effective limit for `feature` at `now`: an unexpired override,
    /// else the plan's limit.
    pub fn limit_at(&self, feature: &str, now: DateTime<Utc>) -> Option<i64> {
        self.overrides
            .get(feature)
            .filter(|o| o.expires_at.is_none_or(|exp| exp > now))
            .map(|o| o.limit)
            .or_else(|| self.plan.get(feature).copied())
    }

    /// Every feature with an effective limit at `now`.
    pub fn limits_at(&self, now: DateTime<Utc>) -> HashMap<String, i64> {
        self.plan
            .keys()
            .chain(self.overrides.keys())
            .filter_map(|f| self.limit_at(f, now).map(|l| (f.clone(), l)))
            .collect()
    }
}

/// Resolves `(tenant, feature) -> limit` from the tenant's active plan and
/// its overrides, caching each tenant's set for a bounded time.
///
/// Override writes go through [`set_override`](Self::set_override) and
/// [`remove_override`](Self::remove_override), which drop the tenant's
/// cache entry before returning.
#[derive(Clone)]
pub struct EntitlementService {
    billing: Arc<dyn BillingStore>,
    guard: PersistenceGuard,
    cache: Cache<TenantId, Arc<EntitlementSet>>,
}

impl std::fmt::Debug for EntitlementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementService")
            .field("cached_tenants", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl EntitlementService {
    pub fn new(
        billing: Arc<dyn BillingStore>,
        guard: PersistenceGuard,
        config: &EntitlementConfig,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl())
            .build();
        Self {
            billing,
            guard,
            cache,
        }
    }

    pub async fn get_limit(
        &self,
        tenant: TenantId,
        feature: &str,
    ) -> Result<Option<i64>, EntitlementError> {
        Ok(self.entitlements(tenant).await?.limit_at(feature, Utc::now()))
    }

    /// The tenant's entitlement set, from cache or storage.
    ///
    /// Concurrent misses for one tenant share a single load.
    pub async fn entitlements(&self, tenant: TenantId) -> Result<Arc<EntitlementSet>, EntitlementError> {
        let this = self.clone();
        self.cache
            .try_get_with(tenant, async move { this.load(tenant).await.map(Arc::new) })
            .await
            .map_err(|shared| {
                Arc::try_unwrap(shared).unwrap_or_else(|e| EntitlementError::Load(e.to_string()))
            })
    }

    #[instrument(skip_all, fields(tenant_id = %tenant))]
    async fn load(&self, tenant: TenantId) -> Result<EntitlementSet, EntitlementError> {
        let mut set = EntitlementSet::default();
        if let Some(subscription) = self.billing.active_subscription(tenant).await? {
            set.plan = self
                .billing
                .plan_features(subscription.plan_id)
                .await?
                .into_iter()
                .map(|f| (f.feature_key, f.limit_value))
                .collect();
        }

        let ctx = FixedTenantContext::system(tenant);
        let overrides = self
            .guard
            .list::<FeatureOverride>(&ctx, Visibility::Live)
            .await?;
        set.overrides = overrides
            .into_iter()
            .map(|o| {
                (
                    o.feature_key,
                    OverrideLimit {
                        limit: o.limit_value,
                        expires_at: o.expires_at,
                    },
                )
            })
            .collect();
        debug!(
            plan_features = set.plan.len(),
            overrides = set.overrides.len(),
            "entitlements loaded"
        );
        Ok(set)
    }

    /// Drop the tenant's cached set; the next read loads from storage.
    pub async fn invalidate(&self, tenant: TenantId) {
        self.cache.invalidate(&tenant).await;
    }

    /// Create or replace the context tenant's override for
    /// `override_.feature_key`.
    #[instrument(skip_all, fields(feature = %override_.feature_key))]
    pub async fn set_override(
        &self,
        ctx: &dyn TenantContext,
        override_: FeatureOverride,
    ) -> Result<FeatureOverride, EntitlementError> {
        let tenant = ctx.tenant().ok_or(GuardError::NoTenantContext)?;
        if override_.feature_key.trim().is_empty() {
            return Err(EntitlementError::InvalidOverride("empty feature key".into()));
        }
        if override_.limit_value < 0 {
            return Err(EntitlementError::InvalidOverride(format!(
                "negative limit {} for {}",
                override_.limit_value, override_.feature_key
            )));
        }

        let saved = match self.existing(ctx, tenant, &override_.feature_key).await? {
            Some(current) => {
                let replaced = FeatureOverride {
                    id: current.id,
                    tenant_id: current.tenant_id,
                    audit: current.audit,
                    ..override_
                };
                self.guard.update(ctx, replaced).await?
            }
            None => self.guard.insert(ctx, override_).await?,
        };
        self.invalidate(tenant).await;
        info!(
            tenant_id = %tenant,
            limit = saved.limit_value,
            expires_at = ?saved.expires_at,
            "feature override saved"
        );
        Ok(saved)
    }

    /// Remove the context tenant's override for `feature`. Returns whether
    /// one existed.
    #[instrument(skip(self, ctx))]
    pub async fn remove_override(
        &self,
        ctx: &dyn TenantContext,
        feature: &str,
    ) -> Result<bool, EntitlementError> {
        let tenant = ctx.tenant().ok_or(GuardError::NoTenantContext)?;
        let Some(current) = self.existing(ctx, tenant, feature).await? else {
            return Ok(false);
        };
        self.guard
            .delete::<FeatureOverride>(ctx, &current.id.to_string())
            .await?;
        self.invalidate(tenant).await;
        info!(tenant_id = %tenant, "feature override removed");
        Ok(true)
    }

    async fn existing(
        &self,
        ctx: &dyn TenantContext,
        tenant: TenantId,
        feature: &str,
    ) -> Result<Option<FeatureOverride>, EntitlementError> {
        Ok(self
            .guard
            .find_by_natural_key::<FeatureOverride>(ctx, &format!("{tenant}:{feature}"), Visibility::Live)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn set() -> EntitlementSet {
        let now = Utc::now();
        EntitlementSet {
            plan: HashMap::from([("api_calls".to_owned(), 100), ("seats".to_owned(), 5)]),
            overrides: HashMap::from([
                (
                    "api_calls".to_owned(),
                    OverrideLimit {
                        limit: 200,
                        expires_at: Some(now + Duration::hours(1)),
                    },
                ),
                (
                    "exports".to_owned(),
                    OverrideLimit {
                        limit: 3,
                        expires_at: None,
                    },
                ),
            ]),
        }
    }

    #[test]
    fn override_wins_until_it_expires() {
        let set = set();
        let now = Utc::now();
        assert_eq!(set.limit_at("api_calls", now), Some(200));
        assert_eq!(set.limit_at("api_calls", now + Duration::hours(2)), Some(100));
        assert_eq!(set.limit_at("exports", now), Some(3));
        assert_eq!(set.limit_at("storage_bytes", now), None);
    }

    #[test]
    fn limits_merge_plan_and_overrides() {
        let limits = set().limits_at(Utc::now());
        assert_eq!(limits.len(), 3);
        assert_eq!(limits["api_calls"], 200);
        assert_eq!(limits["seats"], 5);
    }
}
