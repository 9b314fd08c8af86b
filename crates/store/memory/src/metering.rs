use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use tenantry_core::{DayWindow, Overage, Subscription, TenantId, UsageDaily, UsageEvent, UsagePeriod};
use tenantry_store::error::StoreError;
use tenantry_store::metering::{
    DailyRollupReport, InsertOutcome, MeteringStore, PeriodCloseReport, PeriodRollupReport,
};

use crate::MemoryStore;

type DailyKey = (TenantId, String, NaiveDate);
type PeriodKey = (TenantId, String, NaiveDate, NaiveDate);

#[derive(Debug, Clone, Copy, Default)]
struct PeriodState {
    quantity: Decimal,
    closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct MeteringTables {
    events: Vec<UsageEvent>,
    idempotency: HashSet<(TenantId, String, String)>,
    /// Ids of events already folded into a daily row.
    rolled_up: HashSet<Uuid>,
    daily: BTreeMap<DailyKey, Decimal>,
    /// Per day, how much of the daily quantity has been folded into a period.
    period_ledger: HashMap<DailyKey, Decimal>,
    periods: BTreeMap<PeriodKey, PeriodState>,
    overages: Vec<Overage>,
}

#[async_trait]
impl MeteringStore for MemoryStore {
    async fn insert_usage_event(&self, event: &UsageEvent) -> Result<InsertOutcome, StoreError> {
        let mut tables = self.metering.lock();
        let key = (
            event.tenant_id,
            event.key.clone(),
            event.idempotency_key.clone(),
        );
        if !tables.idempotency.insert(key) {
            return Ok(InsertOutcome::Duplicate);
        }
        tables.events.push(event.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn usage_events(
        &self,
        tenant_id: TenantId,
        key: Option<&str>,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        let tables = self.metering.lock();
        Ok(tables
            .events
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| key.is_none_or(|k| e.key == k))
            .cloned()
            .collect())
    }

    async fn rollup_daily(&self, window: DayWindow) -> Result<DailyRollupReport, StoreError> {
        let mut guard = self.metering.lock();
        let tables = &mut *guard;

        let mut report = DailyRollupReport::default();
        let mut touched = HashSet::new();
        for event in &tables.events {
            if !window.contains(event.day()) || tables.rolled_up.contains(&event.id) {
                continue;
            }
            let key = (event.tenant_id, event.key.clone(), event.day());
            *tables.daily.entry(key.clone()).or_default() += event.quantity;
            tables.rolled_up.insert(event.id);
            touched.insert(key);
            report.events_folded += 1;
        }
        report.rows_upserted = touched.len() as u64;
        Ok(report)
    }

    async fn rollup_period(
        &self,
        subscription: &Subscription,
    ) -> Result<PeriodRollupReport, StoreError> {
        let mut guard = self.metering.lock();
        let tables = &mut *guard;

        let mut report = PeriodRollupReport::default();
        let mut touched = HashSet::new();
        for ((tenant, key, day), quantity) in &tables.daily {
            if *tenant != subscription.tenant_id || !subscription.covers(*day) {
                continue;
            }
            let ledger_key = (*tenant, key.clone(), *day);
            let folded = tables.period_ledger.get(&ledger_key).copied().unwrap_or_default();
            let delta = *quantity - folded;
            if delta.is_zero() {
                continue;
            }
            let period_key = (
                *tenant,
                key.clone(),
                subscription.billing_period_start,
                subscription.billing_period_end,
            );
            let period = tables.periods.entry(period_key.clone()).or_default();
            if period.closed {
                continue;
            }
            period.quantity += delta;
            tables.period_ledger.insert(ledger_key, *quantity);
            touched.insert(period_key);
            report.days_folded += 1;
        }
        report.rows_upserted = touched.len() as u64;
        Ok(report)
    }

    async fn close_periods(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<PeriodCloseReport, StoreError> {
        // Lock order: billing before metering.
        let billing = self.billing.read();
        let mut guard = self.metering.lock();
        let tables = &mut *guard;

        let mut report = PeriodCloseReport::default();
        let mut created = Vec::new();
        for ((tenant, key, start, end), state) in &mut tables.periods {
            if state.closed || *end >= today {
                continue;
            }
            let charge = billing.latest_active(*tenant).and_then(|sub| {
                let feature = billing.feature(sub.plan_id, key)?;
                let price = feature.billable_price()?;
                let period = UsagePeriod {
                    tenant_id: *tenant,
                    key: key.clone(),
                    period_start: *start,
                    period_end: *end,
                    quantity: state.quantity,
                    closed: false,
                };
                Overage::compute(&period, sub.id, feature.limit_value, price, now)
            });
            if let Some(overage) = charge {
                let exists = tables.overages.iter().chain(created.iter()).any(|o: &Overage| {
                    o.tenant_id == overage.tenant_id
                        && o.feature_key == overage.feature_key
                        && o.period_start == overage.period_start
                        && o.period_end == overage.period_end
                });
                if !exists {
                    created.push(overage);
                    report.overages_created += 1;
                }
            }
            state.closed = true;
            report.periods_closed += 1;
        }
        tables.overages.extend(created);
        Ok(report)
    }

    async fn usage_daily(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Vec<UsageDaily>, StoreError> {
        let tables = self.metering.lock();
        Ok(tables
            .daily
            .iter()
            .filter(|((tenant, k, _), _)| *tenant == tenant_id && k == key)
            .map(|((tenant, k, day), quantity)| UsageDaily {
                tenant_id: *tenant,
                key: k.clone(),
                day: *day,
                quantity: *quantity,
            })
            .collect())
    }

    async fn usage_periods(&self, tenant_id: TenantId) -> Result<Vec<UsagePeriod>, StoreError> {
        let tables = self.metering.lock();
        Ok(tables
            .periods
            .iter()
            .filter(|((tenant, ..), _)| *tenant == tenant_id)
            .map(|((tenant, key, start, end), state)| UsagePeriod {
                tenant_id: *tenant,
                key: key.clone(),
                period_start: *start,
                period_end: *end,
                quantity: state.quantity,
                closed: state.closed,
            })
            .collect())
    }

    async fn overages(&self, tenant_id: TenantId) -> Result<Vec<Overage>, StoreError> {
        let tables = self.metering.lock();
        Ok(tables
            .overages
            .iter()
            .filter(|o| o.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}
