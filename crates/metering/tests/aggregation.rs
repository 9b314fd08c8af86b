//! End-to-end aggregation over the in-memory store: events to daily rows,
//! daily rows to billing periods, and closed periods to overages.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use tenantry_core::{Plan, PlanFeature, Subscription, Tenant, TenantId};
use tenantry_metering::{
    DailyRollupJob, Job, JobReport, MeteringRecorder, PeriodCloseJob, PeriodRollupJob,
    UsageRecord,
};
use tenantry_store::{BillingStore, MeteringStore};
use tenantry_store_memory::MemoryStore;

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

fn day(s: &str) -> NaiveDate {
    NaiveDate::from_str(s).unwrap()
}

struct Fixture {
    store: MemoryStore,
    recorder: MeteringRecorder,
    daily: DailyRollupJob,
    period: PeriodRollupJob,
    close: PeriodCloseJob,
    tenant: TenantId,
}

/// One tenant on a plan allowing 100 api calls per May, then 0.01 each.
async fn fixture() -> Fixture {
    let store = MemoryStore::new();
    let tenant = Tenant::new("acme");
    let plan = Plan::new("growth");
    store.upsert_tenant(&tenant).await.unwrap();
    store.upsert_plan(&plan).await.unwrap();
    store
        .upsert_plan_feature(
            &PlanFeature::new(plan.id, "api_calls", 100)
                .with_overage_price(Decimal::from_str("0.01").unwrap()),
        )
        .await
        .unwrap();
    store
        .upsert_subscription(&Subscription::active(
            tenant.id,
            plan.id,
            day("2026-05-01"),
            day("2026-05-31"),
        ))
        .await
        .unwrap();

    let shared = Arc::new(store.clone());
    Fixture {
        recorder: MeteringRecorder::new(shared.clone()),
        daily: DailyRollupJob::new(shared.clone()),
        period: PeriodRollupJob::new(shared.clone(), shared.clone()),
        close: PeriodCloseJob::new(shared),
        store,
        tenant: tenant.id,
    }
}

impl Fixture {
    async fn record(&self, quantity: i64, idempotency_key: &str, occurred_at: &str) {
        self.recorder
            .record(
                UsageRecord::new(
                    self.tenant,
                    "api_calls",
                    Decimal::from(quantity),
                    idempotency_key,
                )
                .occurred_at(at(occurred_at)),
            )
            .await
            .unwrap();
    }

    async fn run(&self, job: &dyn Job, now: &str) -> JobReport {
        job.run(at(now), &CancellationToken::new()).await.unwrap()
    }
}

#[tokio::test]
async fn daily_rollup_sums_events_of_a_day() {
    let f = fixture().await;
    f.record(5, "r-1", "2026-05-10T08:00:00Z").await;
    f.record(7, "r-2", "2026-05-10T17:45:00Z").await;

    f.run(&f.daily, "2026-05-11T01:00:00Z").await;

    let daily = f.store.usage_daily(f.tenant, "api_calls").await.unwrap();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].day, day("2026-05-10"));
    assert_eq!(daily[0].quantity, Decimal::from(12));
}

#[tokio::test]
async fn rerunning_rollups_never_double_counts() {
    let f = fixture().await;
    f.record(5, "r-1", "2026-05-10T08:00:00Z").await;
    f.record(7, "r-2", "2026-05-10T17:45:00Z").await;

    for _ in 0..3 {
        f.run(&f.daily, "2026-05-11T01:00:00Z").await;
        f.run(&f.period, "2026-05-11T02:00:00Z").await;
    }
    // The next night's window overlaps the one already folded.
    f.run(&f.daily, "2026-05-12T01:00:00Z").await;
    f.run(&f.period, "2026-05-12T02:00:00Z").await;

    let daily = f.store.usage_daily(f.tenant, "api_calls").await.unwrap();
    assert_eq!(daily[0].quantity, Decimal::from(12));
    let periods = f.store.usage_periods(f.tenant).await.unwrap();
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].quantity, Decimal::from(12));
}

#[tokio::test]
async fn late_event_is_added_without_recounting() {
    let f = fixture().await;
    f.record(5, "r-1", "2026-05-10T08:00:00Z").await;
    f.run(&f.daily, "2026-05-11T01:00:00Z").await;
    f.run(&f.period, "2026-05-11T02:00:00Z").await;

    // Arrives after the first rollup but still inside the lookback.
    f.record(7, "r-2", "2026-05-10T23:59:00Z").await;
    f.run(&f.daily, "2026-05-12T01:00:00Z").await;
    f.run(&f.period, "2026-05-12T02:00:00Z").await;

    let periods = f.store.usage_periods(f.tenant).await.unwrap();
    assert_eq!(periods[0].quantity, Decimal::from(12));
}

#[tokio::test]
async fn period_close_bills_usage_above_the_limit_once() {
    let f = fixture().await;
    f.record(100, "r-1", "2026-05-20T10:00:00Z").await;
    f.record(50, "r-2", "2026-05-21T10:00:00Z").await;
    f.run(&f.daily, "2026-05-22T01:00:00Z").await;
    f.run(&f.period, "2026-05-22T02:00:00Z").await;

    // Still inside the period: nothing closes.
    let report = f.run(&f.close, "2026-05-31T03:00:00Z").await;
    assert_eq!(report, JobReport::PeriodClose(Default::default()));

    let report = f.run(&f.close, "2026-06-01T03:00:00Z").await;
    let JobReport::PeriodClose(report) = report else {
        panic!("unexpected report {report:?}");
    };
    assert_eq!(report.periods_closed, 1);
    assert_eq!(report.overages_created, 1);

    let overages = f.store.overages(f.tenant).await.unwrap();
    assert_eq!(overages.len(), 1);
    assert_eq!(overages[0].quantity_used, Decimal::from(150));
    assert_eq!(overages[0].quantity_over, Decimal::from(50));
    assert_eq!(overages[0].amount, Decimal::from_str("0.50").unwrap());

    f.run(&f.close, "2026-06-02T03:00:00Z").await;
    assert_eq!(f.store.overages(f.tenant).await.unwrap().len(), 1);
    assert!(f.store.usage_periods(f.tenant).await.unwrap()[0].closed);
}

#[tokio::test]
async fn usage_within_the_limit_closes_without_overage() {
    let f = fixture().await;
    f.record(40, "r-1", "2026-05-20T10:00:00Z").await;
    f.run(&f.daily, "2026-05-21T01:00:00Z").await;
    f.run(&f.period, "2026-05-21T02:00:00Z").await;

    f.run(&f.close, "2026-06-01T03:00:00Z").await;

    assert!(f.store.overages(f.tenant).await.unwrap().is_empty());
    assert!(f.store.usage_periods(f.tenant).await.unwrap()[0].closed);
}

#[tokio::test]
async fn closed_period_ignores_later_rollups() {
    let f = fixture().await;
    f.record(10, "r-1", "2026-05-30T10:00:00Z").await;
    f.run(&f.daily, "2026-05-31T01:00:00Z").await;
    f.run(&f.period, "2026-05-31T02:00:00Z").await;
    f.run(&f.close, "2026-06-01T03:00:00Z").await;

    // Arrives after the close but belongs to the closed window.
    f.record(500, "r-2", "2026-05-30T20:00:00Z").await;
    f.run(&f.daily, "2026-06-01T04:00:00Z").await;
    let daily = f.store.usage_daily(f.tenant, "api_calls").await.unwrap();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].day, day("2026-05-30"));
    assert_eq!(daily[0].quantity, Decimal::from(510), "late event reaches the daily row");

    let report = f.run(&f.period, "2026-06-01T05:00:00Z").await;
    assert!(matches!(report, JobReport::PeriodRollup(r) if r.days_folded == 0));

    let periods = f.store.usage_periods(f.tenant).await.unwrap();
    assert_eq!(periods.len(), 1);
    assert!(periods[0].closed);
    assert_eq!(periods[0].quantity, Decimal::from(10));
    assert!(f.store.overages(f.tenant).await.unwrap().is_empty());
}
