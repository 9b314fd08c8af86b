use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tenantry_core::{DayWindow, Overage, Subscription, TenantId, UsageDaily, UsageEvent, UsagePeriod};

use crate::error::StoreError;

/// Result of an idempotent usage insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    /// `(tenant, key, idempotency_key)` already existed; nothing was written.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyRollupReport {
    /// Events folded into daily rows by this run.
    pub events_folded: u64,
    /// Daily rows inserted or accumulated.
    pub rows_upserted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRollupReport {
    /// Daily rows whose (new) quantity was folded into a period.
    pub days_folded: u64,
    /// Period rows inserted or accumulated.
    pub rows_upserted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCloseReport {
    pub periods_closed: u64,
    pub overages_created: u64,
}

/// Usage events, their derived rollups, and overage charges.
///
/// The three rollup operations are the statements behind the aggregation
/// jobs. Each is atomic and safe to repeat: backends track which events and
/// which daily quantities have already been folded, so a second run over the
/// same window adds nothing.
#[async_trait]
pub trait MeteringStore: Send + Sync {
    /// Insert an event unless `(tenant_id, key, idempotency_key)` exists.
    async fn insert_usage_event(&self, event: &UsageEvent) -> Result<InsertOutcome, StoreError>;

    /// Stored events for a tenant, optionally for one key, oldest first.
    async fn usage_events(
        &self,
        tenant_id: TenantId,
        key: Option<&str>,
    ) -> Result<Vec<UsageEvent>, StoreError>;

    /// Fold not-yet-folded events occurring in `window` into daily rows by
    /// accumulation.
    async fn rollup_daily(&self, window: DayWindow) -> Result<DailyRollupReport, StoreError>;

    /// Fold the unfolded part of the tenant's daily rows that fall in the
    /// subscription's billing window into the matching period rows. Closed
    /// periods are never changed.
    async fn rollup_period(
        &self,
        subscription: &Subscription,
    ) -> Result<PeriodRollupReport, StoreError>;

    /// In one transaction: create overages for every open period whose end
    /// is before `today`, then mark those periods closed. Either both
    /// happen or neither does.
    async fn close_periods(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<PeriodCloseReport, StoreError>;

    async fn usage_daily(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Vec<UsageDaily>, StoreError>;

    async fn usage_periods(&self, tenant_id: TenantId) -> Result<Vec<UsagePeriod>, StoreError>;

    async fn overages(&self, tenant_id: TenantId) -> Result<Vec<Overage>, StoreError>;
}
