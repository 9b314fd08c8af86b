use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use tenantry_core::{DayWindow, Plan, PlanFeature, Subscription, Tenant, TenantId};

use crate::error::StoreError;

/// Tenants, plans, subscriptions and the per-day quota counters.
///
/// These are provisioning and billing records owned by the system rather
/// than by a tenant's unit of work, so they are read and written directly,
/// not through the persistence guard.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    async fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>, StoreError>;

    async fn upsert_plan(&self, plan: &Plan) -> Result<(), StoreError>;

    /// Insert or replace the limit for `(plan_id, feature_key)`.
    async fn upsert_plan_feature(&self, feature: &PlanFeature) -> Result<(), StoreError>;

    async fn plan_features(&self, plan_id: Uuid) -> Result<Vec<PlanFeature>, StoreError>;

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// The tenant's most recently created active subscription.
    async fn active_subscription(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<Subscription>, StoreError>;

    /// The latest active subscription of every tenant that has one.
    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Usage counted for `day`, zero when no counter exists.
    async fn quota_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &str,
        day: NaiveDate,
    ) -> Result<i64, StoreError>;

    /// Add `by` to the counter for the window starting at `window.start`,
    /// creating it if needed. Returns the new value.
    async fn increment_quota_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &str,
        window: DayWindow,
        by: i64,
    ) -> Result<i64, StoreError>;
}
