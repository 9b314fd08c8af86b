//! Conformance suites shared by every backend.
//!
//! Each suite creates its own tenants, so suites may run against a shared
//! database without interfering with each other or with earlier runs.

use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use tenantry_core::{
    DayWindow, Plan, PlanFeature, Subscription, SubscriptionStatus, Tenant, TenantId, UsageEvent,
};

use crate::billing::BillingStore;
use crate::error::StoreError;
use crate::lock::DistributedLock;
use crate::metering::{InsertOutcome, MeteringStore};
use crate::row::{ChangeLogEntry, ChangeOperation, Row, RowQuery, RowScope, RowStore};

fn test_row(kind: &str, tenant: Option<TenantId>, natural_key: Option<&str>) -> Row {
    Row {
        kind: kind.to_owned(),
        id: Uuid::now_v7().to_string(),
        tenant_id: tenant,
        natural_key: natural_key.map(str::to_owned),
        body: serde_json::json!({ "name": "row" }),
        deleted: false,
        updated_at: Utc::now(),
    }
}

fn change(row: &Row, op: ChangeOperation) -> ChangeLogEntry {
    ChangeLogEntry {
        id: Uuid::now_v7(),
        tenant_id: row.tenant_id,
        entity_kind: row.kind.clone(),
        entity_id: row.id.clone(),
        operation: op,
        old_values: None,
        new_values: Some(row.body.clone()),
        actor: "system".to_owned(),
        at: Utc::now(),
    }
}

/// Run the full row store conformance test suite.
///
/// Call this from your backend's test module with a fresh store instance.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_row_store_conformance_tests(store: &dyn RowStore) -> Result<(), StoreError> {
    test_insert_commit_and_get(store).await?;
    test_rollback_discards(store).await?;
    test_duplicate_natural_key(store).await?;
    test_update_and_delete(store).await?;
    test_update_missing(store).await?;
    test_scope_filtering(store).await?;
    test_list_hides_deleted(store).await?;
    test_change_log_is_transactional(store).await?;
    Ok(())
}

async fn test_insert_commit_and_get(store: &dyn RowStore) -> Result<(), StoreError> {
    let tenant = TenantId::generate();
    let row = test_row("conf_item", Some(tenant), None);

    let mut tx = store.begin().await?;
    tx.insert(row.clone()).await?;
    let staged = tx.fetch(&row.kind, &row.id).await?;
    assert!(staged.is_some(), "insert should be visible inside its transaction");
    tx.commit().await?;

    let got = store.get(&row.kind, &row.id, RowScope::Tenant(tenant)).await?;
    let got = got.expect("committed row should be readable");
    assert_eq!(got.body, row.body);
    assert_eq!(got.tenant_id, Some(tenant));
    Ok(())
}

async fn test_rollback_discards(store: &dyn RowStore) -> Result<(), StoreError> {
    let row = test_row("conf_item", Some(TenantId::generate()), None);

    let mut tx = store.begin().await?;
    tx.insert(row.clone()).await?;
    tx.rollback().await?;

    let got = store.get(&row.kind, &row.id, RowScope::AllTenants).await?;
    assert!(got.is_none(), "rolled back insert must not be visible");

    let mut tx = store.begin().await?;
    tx.insert(row.clone()).await?;
    drop(tx);
    let got = store.get(&row.kind, &row.id, RowScope::AllTenants).await?;
    assert!(got.is_none(), "dropped transaction must not commit");
    Ok(())
}

async fn test_duplicate_natural_key(store: &dyn RowStore) -> Result<(), StoreError> {
    let key = format!("conf/{}", Uuid::now_v7());
    let first = test_row("conf_item", Some(TenantId::generate()), Some(&key));
    let second = test_row("conf_item", Some(TenantId::generate()), Some(&key));

    let mut tx = store.begin().await?;
    tx.insert(first.clone()).await?;
    tx.commit().await?;

    let mut tx = store.begin().await?;
    let err = tx
        .insert(second)
        .await
        .expect_err("second insert with the same natural key must fail");
    assert!(
        matches!(err, StoreError::UniqueViolation(_)),
        "expected UniqueViolation, got {err:?}"
    );
    tx.rollback().await?;

    let mut tx = store.begin().await?;
    let err = tx
        .insert(first.clone())
        .await
        .expect_err("insert with a taken id must fail");
    assert!(matches!(err, StoreError::UniqueViolation(_)));
    tx.rollback().await?;

    let found = store
        .find_by_natural_key("conf_item", &key, RowScope::AllTenants)
        .await?
        .expect("natural key lookup should find the first row");
    assert_eq!(found.id, first.id);
    Ok(())
}

async fn test_update_and_delete(store: &dyn RowStore) -> Result<(), StoreError> {
    let tenant = TenantId::generate();
    let mut row = test_row("conf_item", Some(tenant), None);

    let mut tx = store.begin().await?;
    tx.insert(row.clone()).await?;
    tx.commit().await?;

    row.body = serde_json::json!({ "name": "renamed" });
    let mut tx = store.begin().await?;
    tx.update(row.clone()).await?;
    tx.commit().await?;

    let got = store
        .get(&row.kind, &row.id, RowScope::Tenant(tenant))
        .await?
        .expect("row should exist");
    assert_eq!(got.body["name"], "renamed");

    let mut tx = store.begin().await?;
    assert!(tx.delete(&row.kind, &row.id).await?, "delete should report existing row");
    assert!(!tx.delete(&row.kind, &row.id).await?, "second delete should report absence");
    tx.commit().await?;

    let got = store.get(&row.kind, &row.id, RowScope::AllTenants).await?;
    assert!(got.is_none(), "deleted row should be gone");
    Ok(())
}

async fn test_update_missing(store: &dyn RowStore) -> Result<(), StoreError> {
    let row = test_row("conf_item", Some(TenantId::generate()), None);
    let mut tx = store.begin().await?;
    let err = tx.update(row).await.expect_err("update of a missing row must fail");
    assert!(matches!(err, StoreError::NotFound { .. }));
    tx.rollback().await?;
    Ok(())
}

async fn test_scope_filtering(store: &dyn RowStore) -> Result<(), StoreError> {
    let owner = TenantId::generate();
    let other = TenantId::generate();
    let key = format!("conf/{}", Uuid::now_v7());
    let row = test_row("conf_scoped", Some(owner), Some(&key));

    let mut tx = store.begin().await?;
    tx.insert(row.clone()).await?;
    tx.commit().await?;

    assert!(
        store
            .get(&row.kind, &row.id, RowScope::Tenant(other))
            .await?
            .is_none(),
        "other tenant must not read the row by id"
    );
    assert!(
        store
            .find_by_natural_key(&row.kind, &key, RowScope::Tenant(other))
            .await?
            .is_none(),
        "other tenant must not read the row by natural key"
    );
    let listed = store
        .list(&RowQuery::new("conf_scoped", RowScope::Tenant(other)))
        .await?;
    assert!(listed.iter().all(|r| r.tenant_id == Some(other)));
    assert!(!listed.iter().any(|r| r.id == row.id));

    let listed = store
        .list(&RowQuery::new("conf_scoped", RowScope::Tenant(owner)))
        .await?;
    assert_eq!(listed.len(), 1);
    Ok(())
}

async fn test_list_hides_deleted(store: &dyn RowStore) -> Result<(), StoreError> {
    let tenant = TenantId::generate();
    let live = test_row("conf_listed", Some(tenant), None);
    let mut gone = test_row("conf_listed", Some(tenant), None);
    gone.deleted = true;

    let mut tx = store.begin().await?;
    tx.insert(live.clone()).await?;
    tx.insert(gone.clone()).await?;
    tx.commit().await?;

    let visible = store
        .list(&RowQuery::new("conf_listed", RowScope::Tenant(tenant)))
        .await?;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, live.id);

    let all = store
        .list(&RowQuery::new("conf_listed", RowScope::Tenant(tenant)).with_deleted())
        .await?;
    assert_eq!(all.len(), 2);

    let limited = store
        .list(
            &RowQuery::new("conf_listed", RowScope::Tenant(tenant))
                .with_deleted()
                .with_limit(1),
        )
        .await?;
    assert_eq!(limited.len(), 1);
    Ok(())
}

async fn test_change_log_is_transactional(store: &dyn RowStore) -> Result<(), StoreError> {
    let tenant = TenantId::generate();
    let row = test_row("conf_logged", Some(tenant), None);

    let mut tx = store.begin().await?;
    tx.insert(row.clone()).await?;
    tx.append_change(change(&row, ChangeOperation::Insert)).await?;
    tx.rollback().await?;
    assert!(store.change_log(Some(tenant)).await?.is_empty());

    let mut tx = store.begin().await?;
    tx.insert(row.clone()).await?;
    tx.append_change(change(&row, ChangeOperation::Insert)).await?;
    tx.commit().await?;

    let log = store.change_log(Some(tenant)).await?;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].operation, ChangeOperation::Insert);
    assert_eq!(log[0].entity_id, row.id);
    Ok(())
}

fn at(day: NaiveDate, hour: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_hms_opt(hour, 0, 0).unwrap_or_default())
}

fn days_ago(today: NaiveDate, n: u64) -> NaiveDate {
    today.checked_sub_days(Days::new(n)).unwrap_or(today)
}

fn event(tenant: TenantId, key: &str, qty: i64, idem: &str, when: DateTime<Utc>) -> UsageEvent {
    UsageEvent::new(tenant, key, Decimal::from(qty), "conformance", idem, when)
}

/// Run the metering store conformance suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_metering_conformance_tests<S>(store: &S) -> Result<(), StoreError>
where
    S: MeteringStore + BillingStore,
{
    test_idempotent_insert(store).await?;
    test_daily_rollup_accumulates_once(store).await?;
    test_daily_rollup_picks_up_late_events(store).await?;
    test_period_rollup_folds_deltas(store).await?;
    test_close_creates_overage_once(store).await?;
    test_close_without_price(store).await?;
    Ok(())
}

async fn test_idempotent_insert(store: &dyn MeteringStore) -> Result<(), StoreError> {
    let tenant = TenantId::generate();
    let now = Utc::now();
    let first = event(tenant, "k", 5, "idem-1", now);
    let second = event(tenant, "k", 9, "idem-1", now);

    assert_eq!(store.insert_usage_event(&first).await?, InsertOutcome::Inserted);
    assert_eq!(store.insert_usage_event(&second).await?, InsertOutcome::Duplicate);

    let other_key = event(tenant, "other", 1, "idem-1", now);
    assert_eq!(
        store.insert_usage_event(&other_key).await?,
        InsertOutcome::Inserted,
        "same idempotency key under another metered key is distinct"
    );

    let stored = store.usage_events(tenant, Some("k")).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].quantity, Decimal::from(5), "first write wins");
    Ok(())
}

async fn test_daily_rollup_accumulates_once(store: &dyn MeteringStore) -> Result<(), StoreError> {
    let tenant = TenantId::generate();
    let today = Utc::now().date_naive();
    let d = days_ago(today, 1);

    store.insert_usage_event(&event(tenant, "k", 5, "a", at(d, 3))).await?;
    store.insert_usage_event(&event(tenant, "k", 7, "b", at(d, 20))).await?;
    // Outside the window.
    store
        .insert_usage_event(&event(tenant, "k", 100, "c", at(today, 0)))
        .await?;

    let report = store.rollup_daily(DayWindow::single(d)).await?;
    assert!(report.events_folded >= 2);

    let daily = store.usage_daily(tenant, "k").await?;
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].day, d);
    assert_eq!(daily[0].quantity, Decimal::from(12));

    store.rollup_daily(DayWindow::single(d)).await?;
    let daily = store.usage_daily(tenant, "k").await?;
    assert_eq!(daily[0].quantity, Decimal::from(12), "re-run must not double count");
    Ok(())
}

async fn test_daily_rollup_picks_up_late_events(
    store: &dyn MeteringStore,
) -> Result<(), StoreError> {
    let tenant = TenantId::generate();
    let today = Utc::now().date_naive();
    let d = days_ago(today, 2);

    store.insert_usage_event(&event(tenant, "k", 4, "a", at(d, 1))).await?;
    store.rollup_daily(DayWindow::single(d)).await?;

    store.insert_usage_event(&event(tenant, "k", 6, "late", at(d, 2))).await?;
    store.rollup_daily(DayWindow::new(d, today)).await?;

    let daily = store.usage_daily(tenant, "k").await?;
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].quantity, Decimal::from(10));
    Ok(())
}

async fn test_period_rollup_folds_deltas<S>(store: &S) -> Result<(), StoreError>
where
    S: MeteringStore + BillingStore,
{
    let tenant = TenantId::generate();
    let today = Utc::now().date_naive();
    let d = days_ago(today, 1);

    let plan = Plan::new("conformance");
    store.upsert_plan(&plan).await?;
    let sub = Subscription::active(tenant, plan.id, days_ago(today, 10), days_ago(today, 0) + Days::new(20));
    store.upsert_subscription(&sub).await?;

    store.insert_usage_event(&event(tenant, "k", 5, "a", at(d, 1))).await?;
    store.insert_usage_event(&event(tenant, "k", 7, "b", at(d, 2))).await?;
    MeteringStore::rollup_daily(store, DayWindow::single(d)).await?;

    store.rollup_period(&sub).await?;
    store.rollup_period(&sub).await?;
    let periods = store.usage_periods(tenant).await?;
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].quantity, Decimal::from(12));
    assert_eq!(periods[0].period_start, sub.billing_period_start);
    assert_eq!(periods[0].period_end, sub.billing_period_end);
    assert!(!periods[0].closed);

    store.insert_usage_event(&event(tenant, "k", 3, "c", at(d, 5))).await?;
    MeteringStore::rollup_daily(store, DayWindow::single(d)).await?;
    store.rollup_period(&sub).await?;
    let periods = store.usage_periods(tenant).await?;
    assert_eq!(periods[0].quantity, Decimal::from(15));
    Ok(())
}

async fn seed_past_period<S>(
    store: &S,
    tenant: TenantId,
    quantity: i64,
    price: Option<Decimal>,
) -> Result<Subscription, StoreError>
where
    S: MeteringStore + BillingStore,
{
    let today = Utc::now().date_naive();
    let start = days_ago(today, 40);
    let end = days_ago(today, 10);

    store.upsert_tenant(&Tenant {
        id: tenant,
        name: "conformance".into(),
        active: true,
        created_at: Utc::now(),
    })
    .await?;
    let plan = Plan::new("metered");
    store.upsert_plan(&plan).await?;
    let mut feature = PlanFeature::new(plan.id, "k", 100);
    feature.overage_price = price;
    store.upsert_plan_feature(&feature).await?;
    let sub = Subscription::active(tenant, plan.id, start, end);
    store.upsert_subscription(&sub).await?;

    let day = days_ago(today, 20);
    store
        .insert_usage_event(&event(tenant, "k", quantity, "seed", at(day, 12)))
        .await?;
    MeteringStore::rollup_daily(store, DayWindow::single(day)).await?;
    store.rollup_period(&sub).await?;
    Ok(sub)
}

async fn test_close_creates_overage_once<S>(store: &S) -> Result<(), StoreError>
where
    S: MeteringStore + BillingStore,
{
    let tenant = TenantId::generate();
    let sub = seed_past_period(store, tenant, 150, Some(Decimal::new(1, 2))).await?;
    let today = Utc::now().date_naive();

    let report = store.close_periods(today, Utc::now()).await?;
    assert!(report.periods_closed >= 1);
    assert!(report.overages_created >= 1);

    let overages = store.overages(tenant).await?;
    assert_eq!(overages.len(), 1);
    assert_eq!(overages[0].subscription_id, sub.id);
    assert_eq!(overages[0].quantity_used, Decimal::from(150));
    assert_eq!(overages[0].quantity_over, Decimal::from(50));
    assert_eq!(overages[0].amount, Decimal::new(50, 2));

    let periods = store.usage_periods(tenant).await?;
    assert!(periods.iter().all(|p| p.closed), "period should be closed");

    store.close_periods(today, Utc::now()).await?;
    assert_eq!(store.overages(tenant).await?.len(), 1, "re-run must not duplicate");
    assert!(store.usage_periods(tenant).await?.iter().all(|p| p.closed));

    // Folding into a closed period changes nothing.
    let day = days_ago(today, 20);
    store
        .insert_usage_event(&event(tenant, "k", 10, "after-close", at(day, 13)))
        .await?;
    MeteringStore::rollup_daily(store, DayWindow::single(day)).await?;
    store.rollup_period(&sub).await?;
    let periods = store.usage_periods(tenant).await?;
    assert_eq!(periods[0].quantity, Decimal::from(150));
    Ok(())
}

async fn test_close_without_price<S>(store: &S) -> Result<(), StoreError>
where
    S: MeteringStore + BillingStore,
{
    let tenant = TenantId::generate();
    seed_past_period(store, tenant, 150, None).await?;

    store
        .close_periods(Utc::now().date_naive(), Utc::now())
        .await?;
    assert!(store.overages(tenant).await?.is_empty());
    assert!(store.usage_periods(tenant).await?.iter().all(|p| p.closed));
    Ok(())
}

/// Run the billing store conformance suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_billing_conformance_tests(store: &dyn BillingStore) -> Result<(), StoreError> {
    test_tenant_roundtrip(store).await?;
    test_plan_features_upsert(store).await?;
    test_active_subscription_is_latest(store).await?;
    test_quota_counter(store).await?;
    Ok(())
}

async fn test_tenant_roundtrip(store: &dyn BillingStore) -> Result<(), StoreError> {
    let tenant = Tenant::new("acme");
    store.upsert_tenant(&tenant).await?;
    let got = store.get_tenant(tenant.id).await?.expect("tenant should exist");
    assert_eq!(got.name, "acme");
    assert!(got.active);

    store.upsert_tenant(&tenant.clone().deactivated()).await?;
    let got = store.get_tenant(tenant.id).await?.expect("tenant should exist");
    assert!(!got.active, "deactivation should persist");
    Ok(())
}

async fn test_plan_features_upsert(store: &dyn BillingStore) -> Result<(), StoreError> {
    let plan = Plan::new("pro");
    store.upsert_plan(&plan).await?;
    store
        .upsert_plan_feature(&PlanFeature::new(plan.id, "seats", 5))
        .await?;
    store
        .upsert_plan_feature(&PlanFeature::new(plan.id, "seats", 10).with_overage_price(Decimal::ONE))
        .await?;
    store
        .upsert_plan_feature(&PlanFeature::new(plan.id, "storage_bytes", 1_000))
        .await?;

    let mut features = store.plan_features(plan.id).await?;
    features.sort_by(|a, b| a.feature_key.cmp(&b.feature_key));
    assert_eq!(features.len(), 2);
    assert_eq!(features[0].feature_key, "seats");
    assert_eq!(features[0].limit_value, 10);
    assert_eq!(features[0].overage_price, Some(Decimal::ONE));
    Ok(())
}

async fn test_active_subscription_is_latest(store: &dyn BillingStore) -> Result<(), StoreError> {
    let tenant = TenantId::generate();
    let today = Utc::now().date_naive();
    let plan = Plan::new("basic");
    store.upsert_plan(&plan).await?;

    let mut older = Subscription::active(tenant, plan.id, days_ago(today, 60), days_ago(today, 30));
    older.created_at = Utc::now() - chrono::Duration::days(60);
    store.upsert_subscription(&older).await?;

    let newer = Subscription::active(tenant, plan.id, days_ago(today, 5), today + Days::new(25));
    store.upsert_subscription(&newer).await?;

    let mut canceled = Subscription::active(tenant, plan.id, today, today + Days::new(30));
    canceled.status = SubscriptionStatus::Canceled;
    canceled.created_at = Utc::now() + chrono::Duration::seconds(5);
    store.upsert_subscription(&canceled).await?;

    let active = store
        .active_subscription(tenant)
        .await?
        .expect("tenant has an active subscription");
    assert_eq!(active.id, newer.id);

    let all = store.active_subscriptions().await?;
    let mine: Vec<_> = all.iter().filter(|s| s.tenant_id == tenant).collect();
    assert_eq!(mine.len(), 1, "one active subscription per tenant");
    assert_eq!(mine[0].id, newer.id);

    assert!(store.active_subscription(TenantId::generate()).await?.is_none());
    Ok(())
}

async fn test_quota_counter(store: &dyn BillingStore) -> Result<(), StoreError> {
    let tenant = TenantId::generate();
    let today = Utc::now().date_naive();
    let window = DayWindow::single(today);

    assert_eq!(store.quota_usage(tenant, "api_calls", today).await?, 0);
    assert_eq!(store.increment_quota_usage(tenant, "api_calls", window, 1).await?, 1);
    assert_eq!(store.increment_quota_usage(tenant, "api_calls", window, 2).await?, 3);
    assert_eq!(store.quota_usage(tenant, "api_calls", today).await?, 3);

    let tomorrow = DayWindow::single(window.end);
    assert_eq!(store.quota_usage(tenant, "api_calls", tomorrow.start).await?, 0);
    assert_eq!(store.increment_quota_usage(tenant, "api_calls", tomorrow, 1).await?, 1);
    Ok(())
}

/// Run the full distributed lock conformance test suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_lock_conformance_tests(lock: &dyn DistributedLock) -> Result<(), StoreError> {
    let suffix = Uuid::now_v7();
    test_lock_acquire_release(lock, &format!("conf-lock-1-{suffix}")).await?;
    test_lock_contention(lock, &format!("conf-lock-2-{suffix}")).await?;
    test_lock_extend(lock, &format!("conf-lock-3-{suffix}")).await?;
    test_lock_acquire_times_out(lock, &format!("conf-lock-4-{suffix}")).await?;
    Ok(())
}

async fn test_lock_acquire_release(lock: &dyn DistributedLock, name: &str) -> Result<(), StoreError> {
    let guard = lock
        .try_acquire(name, Duration::from_secs(10))
        .await?
        .expect("should acquire uncontested lock");
    assert!(guard.is_held().await?);
    guard.release().await?;

    let again = lock.try_acquire(name, Duration::from_secs(10)).await?;
    assert!(again.is_some(), "released lock should be acquirable");
    if let Some(g) = again {
        g.release().await?;
    }
    Ok(())
}

async fn test_lock_contention(lock: &dyn DistributedLock, name: &str) -> Result<(), StoreError> {
    let held = lock
        .try_acquire(name, Duration::from_secs(10))
        .await?
        .expect("should acquire lock");
    let second = lock.try_acquire(name, Duration::from_secs(10)).await?;
    assert!(second.is_none(), "second acquire should fail while lock is held");
    held.release().await?;
    Ok(())
}

async fn test_lock_extend(lock: &dyn DistributedLock, name: &str) -> Result<(), StoreError> {
    let guard = lock
        .try_acquire(name, Duration::from_secs(5))
        .await?
        .expect("should acquire lock");
    guard.extend(Duration::from_secs(10)).await?;
    assert!(guard.is_held().await?, "lock should still be held after extend");
    guard.release().await?;
    Ok(())
}

async fn test_lock_acquire_times_out(
    lock: &dyn DistributedLock,
    name: &str,
) -> Result<(), StoreError> {
    let held = lock
        .try_acquire(name, Duration::from_secs(10))
        .await?
        .expect("should acquire lock");
    let result = lock
        .acquire(name, Duration::from_secs(10), Duration::from_millis(120))
        .await;
    assert!(
        matches!(result, Err(StoreError::Timeout(_))),
        "acquire on a held lock should time out"
    );
    held.release().await?;
    Ok(())
}
