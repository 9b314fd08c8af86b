use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::Row as _;
use uuid::Uuid;

use tenantry_core::{DayWindow, Plan, PlanFeature, Subscription, SubscriptionStatus, Tenant, TenantId};
use tenantry_store::billing::BillingStore;
use tenantry_store::error::StoreError;

use crate::error::map_sqlx;
use crate::store::PostgresStore;

const SUBSCRIPTION_COLUMNS: &str =
    "id, tenant_id, plan_id, status, billing_period_start, billing_period_end, created_at";

fn decode_subscription(r: &PgRow) -> Result<Subscription, StoreError> {
    let tenant: Uuid = r.try_get("tenant_id").map_err(map_sqlx)?;
    let status: String = r.try_get("status").map_err(map_sqlx)?;
    Ok(Subscription {
        id: r.try_get("id").map_err(map_sqlx)?,
        tenant_id: tenant.into(),
        plan_id: r.try_get("plan_id").map_err(map_sqlx)?,
        status: SubscriptionStatus::parse(&status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown subscription status: {status}"))
        })?,
        billing_period_start: r.try_get("billing_period_start").map_err(map_sqlx)?,
        billing_period_end: r.try_get("billing_period_end").map_err(map_sqlx)?,
        created_at: r.try_get("created_at").map_err(map_sqlx)?,
    })
}

#[async_trait]
impl BillingStore for PostgresStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let table = self.config.tenants_table();
        let query = format!(
            "INSERT INTO {table} (id, name, active, created_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, active = EXCLUDED.active"
        );
        sqlx::query(&query)
            .bind(Uuid::from(tenant.id))
            .bind(&tenant.name)
            .bind(tenant.active)
            .bind(tenant.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        let table = self.config.tenants_table();
        let query = format!("SELECT id, name, active, created_at FROM {table} WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.map(|r| {
            let id: Uuid = r.try_get("id").map_err(map_sqlx)?;
            Ok(Tenant {
                id: id.into(),
                name: r.try_get("name").map_err(map_sqlx)?,
                active: r.try_get("active").map_err(map_sqlx)?,
                created_at: r.try_get("created_at").map_err(map_sqlx)?,
            })
        })
        .transpose()
    }

    async fn upsert_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        let table = self.config.plans_table();
        let query = format!(
            "INSERT INTO {table} (id, name, active) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, active = EXCLUDED.active"
        );
        sqlx::query(&query)
            .bind(plan.id)
            .bind(&plan.name)
            .bind(plan.active)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn upsert_plan_feature(&self, feature: &PlanFeature) -> Result<(), StoreError> {
        let table = self.config.plan_features_table();
        let query = format!(
            "INSERT INTO {table} (plan_id, feature_key, limit_value, overage_price) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (plan_id, feature_key) \
             DO UPDATE SET limit_value = EXCLUDED.limit_value, overage_price = EXCLUDED.overage_price"
        );
        sqlx::query(&query)
            .bind(feature.plan_id)
            .bind(&feature.feature_key)
            .bind(feature.limit_value)
            .bind(feature.overage_price)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn plan_features(&self, plan_id: Uuid) -> Result<Vec<PlanFeature>, StoreError> {
        let table = self.config.plan_features_table();
        let query = format!(
            "SELECT plan_id, feature_key, limit_value, overage_price FROM {table} \
             WHERE plan_id = $1 ORDER BY feature_key"
        );
        let rows = sqlx::query(&query)
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|r| {
                Ok(PlanFeature {
                    plan_id: r.try_get("plan_id").map_err(map_sqlx)?,
                    feature_key: r.try_get("feature_key").map_err(map_sqlx)?,
                    limit_value: r.try_get("limit_value").map_err(map_sqlx)?,
                    overage_price: r.try_get("overage_price").map_err(map_sqlx)?,
                })
            })
            .collect()
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let table = self.config.subscriptions_table();
        let query = format!(
            "INSERT INTO {table} ({SUBSCRIPTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET \
                plan_id = EXCLUDED.plan_id, status = EXCLUDED.status, \
                billing_period_start = EXCLUDED.billing_period_start, \
                billing_period_end = EXCLUDED.billing_period_end"
        );
        sqlx::query(&query)
            .bind(subscription.id)
            .bind(Uuid::from(subscription.tenant_id))
            .bind(subscription.plan_id)
            .bind(subscription.status.as_str())
            .bind(subscription.billing_period_start)
            .bind(subscription.billing_period_end)
            .bind(subscription.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn active_subscription(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<Subscription>, StoreError> {
        let table = self.config.subscriptions_table();
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM {table} \
             WHERE tenant_id = $1 AND status = 'active' \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::from(tenant_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_subscription).transpose()
    }

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let table = self.config.subscriptions_table();
        let query = format!(
            "SELECT DISTINCT ON (tenant_id) {SUBSCRIPTION_COLUMNS} FROM {table} \
             WHERE status = 'active' \
             ORDER BY tenant_id, created_at DESC, id DESC"
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_subscription).collect()
    }

    async fn quota_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &str,
        day: NaiveDate,
    ) -> Result<i64, StoreError> {
        let table = self.config.quota_usage_table();
        let query = format!(
            "SELECT usage FROM {table} \
             WHERE tenant_id = $1 AND feature_key = $2 AND period_start = $3"
        );
        let usage: Option<(i64,)> = sqlx::query_as(&query)
            .bind(Uuid::from(tenant_id))
            .bind(feature_key)
            .bind(day)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(usage.map_or(0, |(u,)| u))
    }

    async fn increment_quota_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &str,
        window: DayWindow,
        by: i64,
    ) -> Result<i64, StoreError> {
        let table = self.config.quota_usage_table();
        let query = format!(
            "INSERT INTO {table} AS q (tenant_id, feature_key, period_start, period_end, usage) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (tenant_id, feature_key, period_start) \
             DO UPDATE SET usage = q.usage + EXCLUDED.usage \
             RETURNING usage"
        );
        let (usage,): (i64,) = sqlx::query_as(&query)
            .bind(Uuid::from(tenant_id))
            .bind(feature_key)
            .bind(window.start)
            .bind(window.end)
            .bind(by)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(usage)
    }
}
