//! The assembled worker: scan consumer, notification consumer and scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use tenantry_broker::{QueueBinding, SCAN_ROUTING_KEY, UPLOADS_DESTINATION};
use tenantry_core::TenantId;
use tenantry_entitlements::{EntitlementService, QuotaGate};
use tenantry_metering::{
    DailyRollupJob, JobKind, JobRun, MeteringRecorder, PeriodCloseJob, PeriodRollupJob, Scheduler,
};
use tenantry_pipeline::{
    ConsumerConfig, NotificationIngestor, QueueConsumer, ScanProcessor, UploadService,
    notification_binding,
};
use tenantry_scanner::DynScanner;
use tenantry_storage::ObjectStore;
use tenantry_tenancy::{PersistenceGuard, default_registry};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::factory::{self, Broker, Stores};

/// Every service the worker runs, wired from one [`WorkerConfig`].
pub struct Worker {
    config: WorkerConfig,
    stores: Stores,
    guard: PersistenceGuard,
    storage: Arc<dyn ObjectStore>,
    broker: Broker,
    scanner: Arc<dyn DynScanner>,
    scheduler: Arc<Scheduler>,
    entitlements: EntitlementService,
    quotas: QuotaGate,
    uploads: UploadService,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("scanner", &self.scanner.name())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Connect every configured backend.
    pub async fn build(config: WorkerConfig) -> Result<Self, WorkerError> {
        let stores = factory::create_stores(&config.database).await?;
        let storage = factory::create_object_store(&config.storage).await?;
        let broker = factory::create_broker(&config.broker).await?;
        let scanner = factory::create_scanner(&config.scanner)?;
        Self::from_parts(config, stores, storage, broker, scanner)
    }

    /// Wire already-connected backends.
    pub fn from_parts(
        config: WorkerConfig,
        stores: Stores,
        storage: Arc<dyn ObjectStore>,
        broker: Broker,
        scanner: Arc<dyn DynScanner>,
    ) -> Result<Self, WorkerError> {
        let guard = PersistenceGuard::new(stores.rows.clone(), Arc::new(default_registry()));

        let mut scheduler = Scheduler::new(config.jobs.scheduler_config());
        if config.jobs.distributed_lock {
            scheduler = scheduler.with_lock(stores.lock.clone());
        }
        scheduler
            .register(Arc::new(
                DailyRollupJob::new(stores.metering.clone())
                    .with_lookback_days(config.jobs.lookback_days),
            ))?
            .register(Arc::new(PeriodRollupJob::new(
                stores.metering.clone(),
                stores.billing.clone(),
            )))?
            .register(Arc::new(PeriodCloseJob::new(stores.metering.clone())))?;

        let entitlements =
            EntitlementService::new(stores.billing.clone(), guard.clone(), &config.entitlements);
        let quotas = QuotaGate::new(
            entitlements.clone(),
            stores.billing.clone(),
            config.entitlements.clone(),
        );
        let uploads = UploadService::new(
            storage.clone(),
            broker.publisher.clone(),
            guard.clone(),
            config.storage.bucket.clone(),
        )
        .with_policy(config.upload.clone());

        Ok(Self {
            config,
            stores,
            guard,
            storage,
            broker,
            scanner,
            scheduler: Arc::new(scheduler),
            entitlements,
            quotas,
            uploads,
        })
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn guard(&self) -> &PersistenceGuard {
        &self.guard
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn uploads(&self) -> &UploadService {
        &self.uploads
    }

    pub fn entitlements(&self) -> &EntitlementService {
        &self.entitlements
    }

    pub fn quotas(&self) -> &QuotaGate {
        &self.quotas
    }

    fn scan_consumer(&self) -> QueueConsumer {
        let scan = &self.config.scan;
        let processor = ScanProcessor::new(
            self.guard.clone(),
            self.storage.clone(),
            self.scanner.clone(),
            MeteringRecorder::new(self.stores.metering.clone()),
        )
        .with_buffer_chunks(scan.buffer_chunks);
        let binding = QueueBinding::new(&scan.queue, UPLOADS_DESTINATION, SCAN_ROUTING_KEY);
        QueueConsumer::new(
            self.broker.consumer.clone(),
            Arc::new(processor),
            self.consumer_config(binding, scan.concurrency),
        )
    }

    fn notification_consumer(&self, queue: &str) -> QueueConsumer {
        let ingestor = NotificationIngestor::new(self.storage.clone(), self.broker.publisher.clone());
        QueueConsumer::new(
            self.broker.consumer.clone(),
            Arc::new(ingestor),
            self.consumer_config(notification_binding(queue), self.config.scan.notification_concurrency),
        )
    }

    fn consumer_config(&self, binding: QueueBinding, concurrency: usize) -> ConsumerConfig {
        let defaults = ConsumerConfig::new(binding);
        let reconnect = defaults.reconnect.clone();
        defaults
            .with_concurrency(concurrency)
            .with_reconnect(reconnect, self.config.scan.max_reconnect_attempts)
    }

    /// Run every long-lived task until `cancel` fires.
    ///
    /// A consumer that gives up cancels the others; its error is returned
    /// once they have drained.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        if let Err(e) = self.scanner.ping().await {
            warn!(scanner = self.scanner.name(), error = %e, "scanner not answering yet");
        }

        let mut tasks: JoinSet<Result<(), WorkerError>> = JoinSet::new();

        let scan = self.scan_consumer();
        let token = cancel.clone();
        tasks.spawn(async move { Ok(scan.run(token).await?) });

        if let Some(queue) = &self.config.scan.notification_queue {
            let notifications = self.notification_consumer(queue);
            let token = cancel.clone();
            tasks.spawn(async move { Ok(notifications.run(token).await?) });
        }

        if self.config.jobs.enabled {
            let scheduler = Arc::clone(&self.scheduler);
            let token = cancel.clone();
            tasks.spawn(async move {
                scheduler.run(token).await;
                Ok(())
            });
        } else {
            info!("scheduled jobs disabled");
        }

        info!(
            queue = %self.config.scan.queue,
            notifications = ?self.config.scan.notification_queue,
            "worker running"
        );

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| WorkerError::Task(e.to_string()));
            if let Err(e) | Ok(Err(e)) = result {
                error!(error = %e, "worker task failed, stopping");
                cancel.cancel();
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Run one job now. `None` means another run holds the job.
    #[instrument(skip(self))]
    pub async fn run_job(&self, kind: JobKind) -> Result<Option<JobRun>, WorkerError> {
        let run = self.scheduler.run_now(kind, &CancellationToken::new()).await?;
        match &run {
            Some(run) => info!(attempts = run.attempts, report = %run.report, "job finished"),
            None => info!("job skipped, already running"),
        }
        Ok(run)
    }

    /// The tenant's effective limits and daily quotas as JSON.
    pub async fn limits(&self, tenant: TenantId) -> Result<serde_json::Value, WorkerError> {
        let set = self.entitlements.entitlements(tenant).await?;
        let limits: BTreeMap<String, i64> = set.limits_at(Utc::now()).into_iter().collect();
        let defaults: BTreeMap<&String, &i64> =
            self.config.entitlements.default_quotas.iter().collect();
        Ok(serde_json::json!({
            "tenantId": tenant.to_string(),
            "limits": limits,
            "defaultQuotas": defaults,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::NaiveDate;

    use tenantry_core::{Plan, PlanFeature, Subscription, UserId};
    use tenantry_pipeline::UploadRequest;
    use tenantry_store::{BillingStore, MeteringStore};
    use tenantry_tenancy::FixedTenantContext;

    use super::*;

    const EICAR: &[u8] =
        br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

    fn config() -> WorkerConfig {
        let mut config = WorkerConfig::default();
        config.scanner.backend = "signature".into();
        config.jobs.enabled = false;
        config
    }

    async fn worker(config: WorkerConfig) -> Worker {
        Worker::build(config).await.unwrap()
    }

    #[tokio::test]
    async fn uploads_are_scanned_and_metered() {
        let worker = worker(config()).await;
        worker
            .broker()
            .consumer
            .declare(&QueueBinding::scan_queue())
            .await
            .unwrap();

        let tenant = TenantId::generate();
        let ctx = FixedTenantContext::new(tenant, Some(UserId::generate()));
        let clean = worker
            .uploads()
            .store_and_announce(
                &ctx,
                &UploadRequest::new("report.pdf", "application/pdf", 0),
                Bytes::from_static(b"quarterly numbers"),
            )
            .await
            .unwrap();
        worker
            .uploads()
            .store_and_announce(
                &ctx,
                &UploadRequest::new("eicar.pdf", "application/pdf", 0),
                Bytes::from_static(EICAR),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let metering = worker.stores().metering.clone();
        let settled = async {
            for _ in 0..200 {
                let events = metering.usage_events(tenant, None).await.unwrap();
                if !events.is_empty() {
                    return events;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("clean upload was never metered");
        };
        let (run, events) = tokio::join!(worker.run(cancel.clone()), async {
            let events = settled.await;
            // Let the infected message settle too.
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
            events
        });
        run.unwrap();

        assert_eq!(events.len(), 1, "only the clean file is metered");
        assert!(
            worker
                .storage
                .stat_object(&clean.bucket, &clean.object_key)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let mut config = config();
        config.jobs.enabled = true;
        config.scan.notification_queue = Some("bucket-notifications".into());
        let worker = worker(config).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker.run(cancel))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn jobs_run_on_demand() {
        let worker = worker(config()).await;
        for kind in JobKind::ALL {
            let run = worker.run_job(kind).await.unwrap().unwrap();
            assert_eq!(run.kind, kind);
            assert_eq!(run.attempts, 1);
        }
    }

    #[tokio::test]
    async fn bad_cron_fails_the_build() {
        let mut config = config();
        config.jobs.daily_rollup = Some("every morning".into());
        let err = Worker::build(config).await.unwrap_err();
        assert!(matches!(err, WorkerError::Metering(_)));
    }

    #[tokio::test]
    async fn limits_list_plan_features_and_default_quotas() {
        let mut config = config();
        config.entitlements = config.entitlements.with_default_quota("exports", 5);
        let worker = worker(config).await;

        let plan = Plan::new("starter");
        let billing = &worker.stores().billing;
        billing.upsert_plan(&plan).await.unwrap();
        billing
            .upsert_plan_feature(&PlanFeature::new(plan.id, "seats", 3))
            .await
            .unwrap();
        let tenant = TenantId::generate();
        let today = Utc::now().date_naive();
        billing
            .upsert_subscription(&Subscription::active(
                tenant,
                plan.id,
                NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
                today + chrono::Duration::days(30),
            ))
            .await
            .unwrap();

        let limits = worker.limits(tenant).await.unwrap();
        assert_eq!(limits["limits"]["seats"], 3);
        assert_eq!(limits["defaultQuotas"]["exports"], 5);
        assert_eq!(limits["tenantId"], tenant.to_string());
    }
}
