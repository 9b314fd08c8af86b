use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use tenantry_core::{DayWindow, Plan, PlanFeature, Subscription, Tenant, TenantId};
use tenantry_store::billing::BillingStore;
use tenantry_store::error::StoreError;

use crate::MemoryStore;

#[derive(Debug, Default)]
pub(crate) struct BillingTables {
    tenants: HashMap<TenantId, Tenant>,
    plans: HashMap<Uuid, Plan>,
    features: BTreeMap<(Uuid, String), PlanFeature>,
    subscriptions: HashMap<Uuid, Subscription>,
    quota: HashMap<(TenantId, String, NaiveDate), i64>,
}

impl BillingTables {
    /// The tenant's most recently created active subscription.
    pub(crate) fn latest_active(&self, tenant_id: TenantId) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.is_active())
            .max_by_key(|s| (s.created_at, s.id))
    }

    pub(crate) fn feature(&self, plan_id: Uuid, feature_key: &str) -> Option<&PlanFeature> {
        self.features.get(&(plan_id, feature_key.to_owned()))
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        self.billing.write().tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self.billing.read().tenants.get(&id).cloned())
    }

    async fn upsert_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        self.billing.write().plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn upsert_plan_feature(&self, feature: &PlanFeature) -> Result<(), StoreError> {
        let mut tables = self.billing.write();
        if !tables.plans.contains_key(&feature.plan_id) {
            return Err(StoreError::not_found("plan", feature.plan_id.to_string()));
        }
        tables.features.insert(
            (feature.plan_id, feature.feature_key.clone()),
            feature.clone(),
        );
        Ok(())
    }

    async fn plan_features(&self, plan_id: Uuid) -> Result<Vec<PlanFeature>, StoreError> {
        let tables = self.billing.read();
        Ok(tables
            .features
            .iter()
            .filter(|((plan, _), _)| *plan == plan_id)
            .map(|(_, feature)| feature.clone())
            .collect())
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut tables = self.billing.write();
        if !tables.plans.contains_key(&subscription.plan_id) {
            return Err(StoreError::not_found(
                "plan",
                subscription.plan_id.to_string(),
            ));
        }
        tables
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn active_subscription(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.billing.read().latest_active(tenant_id).cloned())
    }

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let tables = self.billing.read();
        let mut latest: HashMap<TenantId, &Subscription> = HashMap::new();
        for sub in tables.subscriptions.values().filter(|s| s.is_active()) {
            latest
                .entry(sub.tenant_id)
                .and_modify(|cur| {
                    if (sub.created_at, sub.id) > (cur.created_at, cur.id) {
                        *cur = sub;
                    }
                })
                .or_insert(sub);
        }
        let mut subs: Vec<Subscription> = latest.into_values().cloned().collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn quota_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &str,
        day: NaiveDate,
    ) -> Result<i64, StoreError> {
        let tables = self.billing.read();
        Ok(tables
            .quota
            .get(&(tenant_id, feature_key.to_owned(), day))
            .copied()
            .unwrap_or(0))
    }

    async fn increment_quota_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &str,
        window: DayWindow,
        by: i64,
    ) -> Result<i64, StoreError> {
        let mut tables = self.billing.write();
        let counter = tables
            .quota
            .entry((tenant_id, feature_key.to_owned(), window.start))
            .or_insert(0);
        *counter = counter.saturating_add(by);
        Ok(*counter)
    }
}
