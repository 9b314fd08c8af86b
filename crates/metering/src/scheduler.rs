use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use tenantry_core::RetryStrategy;
use tenantry_store::DistributedLock;

use crate::error::MeteringError;
use crate::jobs::{Job, JobKind, JobReport};

/// Schedules and retry policy for the aggregation jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cron expression per job. Jobs missing here use
    /// [`JobKind::default_schedule`].
    pub schedules: HashMap<JobKind, String>,
    /// Attempts per scheduled run, including the first.
    pub max_attempts: u32,
    pub retry: RetryStrategy,
    /// TTL of the cross-instance lock held while a job runs.
    pub lock_ttl_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedules: HashMap::new(),
            max_attempts: 3,
            retry: RetryStrategy::Exponential {
                base: Duration::from_secs(5),
                max: Duration::from_secs(300),
                multiplier: 2.0,
            },
            lock_ttl_seconds: 30 * 60,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_schedule(mut self, kind: JobKind, cron: impl Into<String>) -> Self {
        self.schedules.insert(kind, cron.into());
        self
    }

    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, retry: RetryStrategy) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry = retry;
        self
    }

    fn schedule_for(&self, kind: JobKind) -> &str {
        self.schedules
            .get(&kind)
            .map_or_else(|| kind.default_schedule(), String::as_str)
    }
}

/// A completed job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
    pub report: JobReport,
}

struct Entry {
    job: Arc<dyn Job>,
    cron: Cron,
    /// Held for the duration of a run; a run that finds it taken is skipped.
    running: Mutex<()>,
}

/// Runs registered jobs on their cron schedules.
///
/// A job never overlaps itself: within this process a second run is
/// skipped while the first is active, and with a [`DistributedLock`]
/// configured the same holds across processes. Different jobs run
/// independently.
pub struct Scheduler {
    entries: Vec<Entry>,
    lock: Option<Arc<dyn DistributedLock>>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs().collect::<Vec<_>>())
            .field("distributed_lock", &self.lock.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            entries: Vec::new(),
            lock: None,
            config,
        }
    }

    #[must_use]
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Add a job with the schedule configured for its kind. Replaces an
    /// earlier job of the same kind.
    pub fn register(&mut self, job: Arc<dyn Job>) -> Result<&mut Self, MeteringError> {
        let kind = job.kind();
        let expr = self.config.schedule_for(kind);
        let cron = Cron::new(expr)
            .parse()
            .map_err(|e| MeteringError::InvalidSchedule {
                job: kind.as_str(),
                reason: format!("{expr:?}: {e}"),
            })?;
        self.entries.retain(|e| e.job.kind() != kind);
        self.entries.push(Entry {
            job,
            cron,
            running: Mutex::new(()),
        });
        Ok(self)
    }

    pub fn jobs(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.entries.iter().map(|e| e.job.kind())
    }

    /// Name of the cross-instance lock guarding `kind`.
    pub fn lock_name(kind: JobKind) -> String {
        format!("job:{kind}")
    }

    /// The first scheduled time strictly after `after`.
    pub fn next_run(&self, kind: JobKind, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entry(kind)?.cron.find_next_occurrence(after, false).ok()
    }

    fn entry(&self, kind: JobKind) -> Option<&Entry> {
        self.entries.iter().find(|e| e.job.kind() == kind)
    }

    /// Run `kind` immediately with the usual overlap protection and retry.
    ///
    /// Returns `Ok(None)` when the run was skipped because the job is
    /// already running here or on another instance.
    pub async fn run_now(
        &self,
        kind: JobKind,
        cancel: &CancellationToken,
    ) -> Result<Option<JobRun>, MeteringError> {
        let entry = self
            .entry(kind)
            .ok_or_else(|| MeteringError::UnknownJob(kind.to_string()))?;
        self.execute(entry, cancel).await
    }

    #[instrument(skip_all, fields(job = %entry.job.kind()))]
    async fn execute(
        &self,
        entry: &Entry,
        cancel: &CancellationToken,
    ) -> Result<Option<JobRun>, MeteringError> {
        let kind = entry.job.kind();
        let Ok(_running) = entry.running.try_lock() else {
            warn!("previous run still active, skipping");
            return Ok(None);
        };

        let guard = match &self.lock {
            Some(lock) => {
                let ttl = Duration::from_secs(self.config.lock_ttl_seconds);
                let Some(guard) = lock.try_acquire(&Self::lock_name(kind), ttl).await? else {
                    info!("job is running on another instance, skipping");
                    return Ok(None);
                };
                Some(guard)
            }
            None => None,
        };

        let result = self.attempt(entry, cancel).await;

        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                warn!(error = %e, "failed to release job lock");
            }
        }
        result.map(Some)
    }

    async fn attempt(
        &self,
        entry: &Entry,
        cancel: &CancellationToken,
    ) -> Result<JobRun, MeteringError> {
        let kind = entry.job.kind();
        let started_at = Utc::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(attempt, "job starting");
            match entry.job.run(Utc::now(), cancel).await {
                Ok(report) => {
                    info!(attempt, %report, "job finished");
                    return Ok(JobRun {
                        kind,
                        started_at,
                        finished_at: Utc::now(),
                        attempts: attempt,
                        report,
                    });
                }
                Err(MeteringError::Cancelled) => return Err(MeteringError::Cancelled),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry.delay_for(attempt - 1);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis(), "job failed, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(MeteringError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(MeteringError::JobFailed {
                        job: kind.as_str(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    /// Drive every registered job on its schedule until `cancel` fires.
    ///
    /// A run in progress when cancellation arrives stops at its next
    /// cancellation check.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        for index in 0..self.entries.len() {
            let scheduler = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { scheduler.drive(index, cancel).await });
        }
        info!(jobs = self.entries.len(), "scheduler started");
        while tasks.join_next().await.is_some() {}
        info!("scheduler stopped");
    }

    async fn drive(&self, index: usize, cancel: CancellationToken) {
        let Some(entry) = self.entries.get(index) else {
            return;
        };
        let kind = entry.job.kind();
        loop {
            let now = Utc::now();
            let Ok(next) = entry.cron.find_next_occurrence(&now, false) else {
                warn!(job = %kind, "schedule has no future occurrence");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(wait) => {}
            }
            match self.execute(entry, &cancel).await {
                Ok(_) => {}
                Err(MeteringError::Cancelled) => return,
                Err(e) => error!(job = %kind, error = %e, "scheduled job failed"),
            }
        }
    }
}
