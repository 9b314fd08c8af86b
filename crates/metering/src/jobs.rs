//! The three aggregation jobs.
//!
//! Each job only reads what an earlier job produced (events, then daily
//! rows, then period rows), so they may run concurrently with one another.
//! Every job is idempotent: the stores track what has already been folded.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use tenantry_core::DayWindow;
use tenantry_store::{
    BillingStore, DailyRollupReport, MeteringStore, PeriodCloseReport, PeriodRollupReport,
};

use crate::error::MeteringError;

/// The schedulable aggregation jobs, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    DailyRollup,
    PeriodRollup,
    PeriodClose,
}

impl JobKind {
    pub const ALL: [Self; 3] = [Self::DailyRollup, Self::PeriodRollup, Self::PeriodClose];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DailyRollup => "daily-rollup",
            Self::PeriodRollup => "period-rollup",
            Self::PeriodClose => "period-close",
        }
    }

    /// Five-field cron expression, evaluated in UTC.
    pub fn default_schedule(self) -> &'static str {
        match self {
            Self::DailyRollup => "0 1 * * *",
            Self::PeriodRollup => "0 2 * * *",
            Self::PeriodClose => "0 3 * * *",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| MeteringError::UnknownJob(s.to_owned()))
    }
}

/// What one job run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "kebab-case")]
pub enum JobReport {
    DailyRollup(DailyRollupReport),
    PeriodRollup(PeriodRollupReport),
    PeriodClose(PeriodCloseReport),
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DailyRollup(r) => write!(
                f,
                "{} events folded into {} daily rows",
                r.events_folded, r.rows_upserted
            ),
            Self::PeriodRollup(r) => write!(
                f,
                "{} days folded into {} period rows",
                r.days_folded, r.rows_upserted
            ),
            Self::PeriodClose(r) => write!(
                f,
                "{} periods closed, {} overages created",
                r.periods_closed, r.overages_created
            ),
        }
    }
}

/// A schedulable unit of aggregation work.
#[async_trait]
pub trait Job: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Run once as of `now`. Implementations check `cancel` between
    /// statements and return [`MeteringError::Cancelled`] when it fires.
    async fn run(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<JobReport, MeteringError>;
}

fn check(cancel: &CancellationToken) -> Result<(), MeteringError> {
    if cancel.is_cancelled() {
        return Err(MeteringError::Cancelled);
    }
    Ok(())
}

/// Folds usage events from the last few complete days into daily rows.
///
/// The window ends at today's UTC midnight. Looking back more than one day
/// picks up events that arrived late; events already folded are skipped by
/// the store, so the overlap is harmless.
pub struct DailyRollupJob {
    store: Arc<dyn MeteringStore>,
    lookback_days: u32,
}

impl DailyRollupJob {
    pub const DEFAULT_LOOKBACK_DAYS: u32 = 3;

    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self {
            store,
            lookback_days: Self::DEFAULT_LOOKBACK_DAYS,
        }
    }

    #[must_use]
    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days.max(1);
        self
    }
}

#[async_trait]
impl Job for DailyRollupJob {
    fn kind(&self) -> JobKind {
        JobKind::DailyRollup
    }

    #[instrument(skip_all, fields(job = "daily-rollup"))]
    async fn run(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<JobReport, MeteringError> {
        check(cancel)?;
        let window = DayWindow::prior_days(&now, self.lookback_days);
        let report = self.store.rollup_daily(window).await?;
        info!(%window, events = report.events_folded, rows = report.rows_upserted, "daily rollup done");
        Ok(JobReport::DailyRollup(report))
    }
}

/// Folds daily rows into the billing period of each active subscription.
pub struct PeriodRollupJob {
    metering: Arc<dyn MeteringStore>,
    billing: Arc<dyn BillingStore>,
}

impl PeriodRollupJob {
    pub fn new(metering: Arc<dyn MeteringStore>, billing: Arc<dyn BillingStore>) -> Self {
        Self { metering, billing }
    }
}

#[async_trait]
impl Job for PeriodRollupJob {
    fn kind(&self) -> JobKind {
        JobKind::PeriodRollup
    }

    #[instrument(skip_all, fields(job = "period-rollup"))]
    async fn run(
        &self,
        _now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<JobReport, MeteringError> {
        check(cancel)?;
        let subscriptions = self.billing.active_subscriptions().await?;
        let mut total = PeriodRollupReport::default();
        for subscription in &subscriptions {
            check(cancel)?;
            let report = self.metering.rollup_period(subscription).await?;
            debug!(
                tenant_id = %subscription.tenant_id,
                period_start = %subscription.billing_period_start,
                period_end = %subscription.billing_period_end,
                days = report.days_folded,
                "period rolled up"
            );
            total.days_folded += report.days_folded;
            total.rows_upserted += report.rows_upserted;
        }
        info!(
            subscriptions = subscriptions.len(),
            days = total.days_folded,
            rows = total.rows_upserted,
            "period rollup done"
        );
        Ok(JobReport::PeriodRollup(total))
    }
}

/// Closes every open period that ended before today, creating overages
/// in the same transaction.
pub struct PeriodCloseJob {
    store: Arc<dyn MeteringStore>,
}

impl PeriodCloseJob {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Job for PeriodCloseJob {
    fn kind(&self) -> JobKind {
        JobKind::PeriodClose
    }

    #[instrument(skip_all, fields(job = "period-close"))]
    async fn run(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<JobReport, MeteringError> {
        check(cancel)?;
        let report = self.store.close_periods(now.date_naive(), now).await?;
        info!(
            closed = report.periods_closed,
            overages = report.overages_created,
            "period close done"
        );
        Ok(JobReport::PeriodClose(report))
    }
}

#[cfg(test)]
mod tests {
    use tenantry_store_memory::MemoryStore;

    use super::*;

    #[test]
    fn job_names_round_trip() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!(matches!(
            "weekly-rollup".parse::<JobKind>(),
            Err(MeteringError::UnknownJob(_))
        ));
    }

    #[test]
    fn default_schedules_run_in_pipeline_order() {
        let hours: Vec<_> = JobKind::ALL
            .iter()
            .map(|k| k.default_schedule().split(' ').nth(1).unwrap())
            .collect();
        assert_eq!(hours, ["1", "2", "3"]);
    }

    #[test]
    fn report_display() {
        let report = JobReport::PeriodClose(PeriodCloseReport {
            periods_closed: 2,
            overages_created: 1,
        });
        assert_eq!(report.to_string(), "2 periods closed, 1 overages created");
    }

    #[tokio::test]
    async fn cancelled_job_does_nothing() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = DailyRollupJob::new(store)
            .run(Utc::now(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::Cancelled));
    }
}
