use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row as _;
use tracing::debug;
use uuid::Uuid;

use tenantry_core::{DayWindow, Overage, Subscription, TenantId, UsageDaily, UsageEvent, UsagePeriod};
use tenantry_store::error::StoreError;
use tenantry_store::metering::{
    DailyRollupReport, InsertOutcome, MeteringStore, PeriodCloseReport, PeriodRollupReport,
};

use crate::error::map_sqlx;
use crate::store::PostgresStore;

fn count(r: &PgRow, column: &str) -> Result<u64, StoreError> {
    let n: i64 = r.try_get(column).map_err(map_sqlx)?;
    Ok(n.unsigned_abs())
}

fn decode_event(r: &PgRow) -> Result<UsageEvent, StoreError> {
    let tenant: Uuid = r.try_get("tenant_id").map_err(map_sqlx)?;
    Ok(UsageEvent {
        id: r.try_get("id").map_err(map_sqlx)?,
        tenant_id: tenant.into(),
        key: r.try_get("key").map_err(map_sqlx)?,
        quantity: r.try_get("quantity").map_err(map_sqlx)?,
        occurred_at: r.try_get("occurred_at").map_err(map_sqlx)?,
        source: r.try_get("source").map_err(map_sqlx)?,
        idempotency_key: r.try_get("idempotency_key").map_err(map_sqlx)?,
        created_at: r.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn decode_period(r: &PgRow) -> Result<UsagePeriod, StoreError> {
    let tenant: Uuid = r.try_get("tenant_id").map_err(map_sqlx)?;
    Ok(UsagePeriod {
        tenant_id: tenant.into(),
        key: r.try_get("key").map_err(map_sqlx)?,
        period_start: r.try_get("period_start").map_err(map_sqlx)?,
        period_end: r.try_get("period_end").map_err(map_sqlx)?,
        quantity: r.try_get("quantity").map_err(map_sqlx)?,
        closed: r.try_get("closed").map_err(map_sqlx)?,
    })
}

fn decode_overage(r: &PgRow) -> Result<Overage, StoreError> {
    let tenant: Uuid = r.try_get("tenant_id").map_err(map_sqlx)?;
    Ok(Overage {
        id: r.try_get("id").map_err(map_sqlx)?,
        tenant_id: tenant.into(),
        subscription_id: r.try_get("subscription_id").map_err(map_sqlx)?,
        feature_key: r.try_get("feature_key").map_err(map_sqlx)?,
        period_start: r.try_get("period_start").map_err(map_sqlx)?,
        period_end: r.try_get("period_end").map_err(map_sqlx)?,
        quantity_used: r.try_get("quantity_used").map_err(map_sqlx)?,
        quantity_over: r.try_get("quantity_over").map_err(map_sqlx)?,
        unit_price: r.try_get("unit_price").map_err(map_sqlx)?,
        amount: r.try_get("amount").map_err(map_sqlx)?,
        created_at: r.try_get("created_at").map_err(map_sqlx)?,
    })
}

#[async_trait]
impl MeteringStore for PostgresStore {
    async fn insert_usage_event(&self, event: &UsageEvent) -> Result<InsertOutcome, StoreError> {
        let table = self.config.usage_events_table();
        let query = format!(
            "INSERT INTO {table} \
             (id, tenant_id, key, quantity, occurred_at, source, idempotency_key, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (tenant_id, key, idempotency_key) DO NOTHING"
        );
        let result = sqlx::query(&query)
            .bind(event.id)
            .bind(Uuid::from(event.tenant_id))
            .bind(&event.key)
            .bind(event.quantity)
            .bind(event.occurred_at)
            .bind(&event.source)
            .bind(&event.idempotency_key)
            .bind(event.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(if result.rows_affected() > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn usage_events(
        &self,
        tenant_id: TenantId,
        key: Option<&str>,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        let table = self.config.usage_events_table();
        let query = format!(
            "SELECT id, tenant_id, key, quantity, occurred_at, source, idempotency_key, created_at \
             FROM {table} WHERE tenant_id = $1 AND ($2::text IS NULL OR key = $2) \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(Uuid::from(tenant_id))
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_event).collect()
    }

    async fn rollup_daily(&self, window: DayWindow) -> Result<DailyRollupReport, StoreError> {
        let events = self.config.usage_events_table();
        let ledger = self.config.rollup_ledger_table();
        let daily = self.config.usage_daily_table();
        // The ledger insert is the claim: only events this statement marked
        // are added, so concurrent or repeated runs cannot count twice.
        let query = format!(
            "WITH pending AS ( \
                 SELECT e.id, e.tenant_id, e.key, \
                        (e.occurred_at AT TIME ZONE 'UTC')::date AS day, e.quantity \
                 FROM {events} e \
                 WHERE e.occurred_at >= $1 AND e.occurred_at < $2 \
                   AND NOT EXISTS (SELECT 1 FROM {ledger} l WHERE l.event_id = e.id) \
             ), marked AS ( \
                 INSERT INTO {ledger} (event_id) SELECT id FROM pending \
                 ON CONFLICT (event_id) DO NOTHING RETURNING event_id \
             ), folded AS ( \
                 SELECT p.tenant_id, p.key, p.day, SUM(p.quantity) AS quantity, COUNT(*) AS events \
                 FROM pending p JOIN marked m ON m.event_id = p.id \
                 GROUP BY p.tenant_id, p.key, p.day \
             ), upserted AS ( \
                 INSERT INTO {daily} AS d (tenant_id, key, day, quantity, updated_at) \
                 SELECT tenant_id, key, day, quantity, NOW() FROM folded \
                 ON CONFLICT (tenant_id, key, day) \
                 DO UPDATE SET quantity = d.quantity + EXCLUDED.quantity, updated_at = NOW() \
                 RETURNING 1 \
             ) \
             SELECT COALESCE((SELECT SUM(events) FROM folded), 0)::BIGINT AS events_folded, \
                    (SELECT COUNT(*) FROM upserted)::BIGINT AS rows_upserted"
        );
        let row = sqlx::query(&query)
            .bind(window.start_instant())
            .bind(window.end_instant())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(DailyRollupReport {
            events_folded: count(&row, "events_folded")?,
            rows_upserted: count(&row, "rows_upserted")?,
        })
    }

    async fn rollup_period(
        &self,
        subscription: &Subscription,
    ) -> Result<PeriodRollupReport, StoreError> {
        let daily = self.config.usage_daily_table();
        let ledger = self.config.period_ledger_table();
        let periods = self.config.usage_periods_table();
        let tenant = Uuid::from(subscription.tenant_id);

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        // Serialize period folding per tenant; the delta is computed from
        // the ledger and must not be read by two runs at once.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(tenant.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let query = format!(
            "WITH delta AS ( \
                 SELECT d.tenant_id, d.key, d.day, d.quantity, \
                        d.quantity - COALESCE(l.folded_quantity, 0) AS delta \
                 FROM {daily} d \
                 LEFT JOIN {ledger} l \
                   ON l.tenant_id = d.tenant_id AND l.key = d.key AND l.day = d.day \
                 WHERE d.tenant_id = $1 AND d.day >= $2 AND d.day < $3 \
                   AND d.quantity <> COALESCE(l.folded_quantity, 0) \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM {periods} p \
                       WHERE p.tenant_id = d.tenant_id AND p.key = d.key \
                         AND p.period_start = $2 AND p.period_end = $3 AND p.closed) \
             ), recorded AS ( \
                 INSERT INTO {ledger} AS l (tenant_id, key, day, folded_quantity) \
                 SELECT tenant_id, key, day, quantity FROM delta \
                 ON CONFLICT (tenant_id, key, day) \
                 DO UPDATE SET folded_quantity = EXCLUDED.folded_quantity \
                 RETURNING 1 \
             ), totals AS ( \
                 SELECT tenant_id, key, SUM(delta) AS delta FROM delta GROUP BY tenant_id, key \
             ), upserted AS ( \
                 INSERT INTO {periods} AS p \
                 (tenant_id, key, period_start, period_end, quantity, closed, updated_at) \
                 SELECT tenant_id, key, $2, $3, delta, FALSE, NOW() FROM totals \
                 ON CONFLICT (tenant_id, key, period_start, period_end) \
                 DO UPDATE SET quantity = p.quantity + EXCLUDED.quantity, updated_at = NOW() \
                 WHERE NOT p.closed \
                 RETURNING 1 \
             ) \
             SELECT (SELECT COUNT(*) FROM recorded)::BIGINT AS days_folded, \
                    (SELECT COUNT(*) FROM upserted)::BIGINT AS rows_upserted"
        );
        let row = sqlx::query(&query)
            .bind(tenant)
            .bind(subscription.billing_period_start)
            .bind(subscription.billing_period_end)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(PeriodRollupReport {
            days_folded: count(&row, "days_folded")?,
            rows_upserted: count(&row, "rows_upserted")?,
        })
    }

    async fn close_periods(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<PeriodCloseReport, StoreError> {
        let periods = self.config.usage_periods_table();
        let subscriptions = self.config.subscriptions_table();
        let features = self.config.plan_features_table();
        let overages = self.config.overages_table();

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let due_query = format!(
            "WITH latest AS ( \
                 SELECT DISTINCT ON (s.tenant_id) s.tenant_id, s.id, s.plan_id \
                 FROM {subscriptions} s WHERE s.status = 'active' \
                 ORDER BY s.tenant_id, s.created_at DESC, s.id DESC \
             ) \
             SELECT p.tenant_id, p.key, p.period_start, p.period_end, p.quantity, p.closed, \
                    ls.id AS subscription_id, f.limit_value, f.overage_price \
             FROM {periods} p \
             LEFT JOIN latest ls ON ls.tenant_id = p.tenant_id \
             LEFT JOIN {features} f ON f.plan_id = ls.plan_id AND f.feature_key = p.key \
             WHERE NOT p.closed AND p.period_end < $1 \
             FOR UPDATE OF p"
        );
        let due = sqlx::query(&due_query)
            .bind(today)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let insert_overage = format!(
            "INSERT INTO {overages} \
             (id, tenant_id, subscription_id, feature_key, period_start, period_end, \
              quantity_used, quantity_over, unit_price, amount, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (tenant_id, feature_key, period_start, period_end) DO NOTHING"
        );
        let close = format!(
            "UPDATE {periods} SET closed = TRUE, updated_at = NOW() \
             WHERE tenant_id = $1 AND key = $2 AND period_start = $3 AND period_end = $4 \
               AND NOT closed"
        );

        let mut report = PeriodCloseReport::default();
        for row in &due {
            let period = decode_period(row)?;
            let subscription_id: Option<Uuid> = row.try_get("subscription_id").map_err(map_sqlx)?;
            let limit: Option<i64> = row.try_get("limit_value").map_err(map_sqlx)?;
            let price: Option<Decimal> = row.try_get("overage_price").map_err(map_sqlx)?;

            let charge = match (subscription_id, limit, price) {
                (Some(sub), Some(limit), Some(price)) => {
                    Overage::compute(&period, sub, limit, price, now)
                }
                _ => None,
            };
            if let Some(o) = charge {
                let result = sqlx::query(&insert_overage)
                    .bind(o.id)
                    .bind(Uuid::from(o.tenant_id))
                    .bind(o.subscription_id)
                    .bind(&o.feature_key)
                    .bind(o.period_start)
                    .bind(o.period_end)
                    .bind(o.quantity_used)
                    .bind(o.quantity_over)
                    .bind(o.unit_price)
                    .bind(o.amount)
                    .bind(o.created_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                report.overages_created += result.rows_affected();
            }

            let result = sqlx::query(&close)
                .bind(Uuid::from(period.tenant_id))
                .bind(&period.key)
                .bind(period.period_start)
                .bind(period.period_end)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            report.periods_closed += result.rows_affected();
        }

        tx.commit().await.map_err(map_sqlx)?;
        debug!(
            periods_closed = report.periods_closed,
            overages_created = report.overages_created,
            "closed billing periods"
        );
        Ok(report)
    }

    async fn usage_daily(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Vec<UsageDaily>, StoreError> {
        let table = self.config.usage_daily_table();
        let query = format!(
            "SELECT tenant_id, key, day, quantity FROM {table} \
             WHERE tenant_id = $1 AND key = $2 ORDER BY day"
        );
        let rows = sqlx::query(&query)
            .bind(Uuid::from(tenant_id))
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|r| {
                let tenant: Uuid = r.try_get("tenant_id").map_err(map_sqlx)?;
                Ok(UsageDaily {
                    tenant_id: tenant.into(),
                    key: r.try_get("key").map_err(map_sqlx)?,
                    day: r.try_get("day").map_err(map_sqlx)?,
                    quantity: r.try_get("quantity").map_err(map_sqlx)?,
                })
            })
            .collect()
    }

    async fn usage_periods(&self, tenant_id: TenantId) -> Result<Vec<UsagePeriod>, StoreError> {
        let table = self.config.usage_periods_table();
        let query = format!(
            "SELECT tenant_id, key, period_start, period_end, quantity, closed FROM {table} \
             WHERE tenant_id = $1 ORDER BY key, period_start"
        );
        let rows = sqlx::query(&query)
            .bind(Uuid::from(tenant_id))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_period).collect()
    }

    async fn overages(&self, tenant_id: TenantId) -> Result<Vec<Overage>, StoreError> {
        let table = self.config.overages_table();
        let query = format!(
            "SELECT id, tenant_id, subscription_id, feature_key, period_start, period_end, \
                    quantity_used, quantity_over, unit_price, amount, created_at \
             FROM {table} WHERE tenant_id = $1 ORDER BY period_start, feature_key"
        );
        let rows = sqlx::query(&query)
            .bind(Uuid::from(tenant_id))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_overage).collect()
    }
}
