//! Processing of one upload-scan event.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tenantry_broker::Message;
use tenantry_core::{FileRecord, ScanStatus, UploadScanEvent, metering};
use tenantry_metering::{MeteringRecorder, UsageRecord};
use tenantry_scanner::{DynScanner, ScanVerdict};
use tenantry_storage::{ObjectStore, StorageError};
use tenantry_store::StoreError;
use tenantry_tenancy::{
    FixedTenantContext, GuardError, PendingChange, PersistenceGuard, TenantContext, Visibility,
};

use crate::error::PipelineError;
use crate::handler::MessageHandler;

const DEFAULT_BUFFER_CHUNKS: usize = 4;

/// What processing an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean {
        file_id: Uuid,
        size: i64,
        checksum: String,
    },
    Infected {
        file_id: Uuid,
        signature: Option<String>,
    },
    /// The object was already scanned; nothing new was recorded.
    Duplicate { file_id: Uuid, status: ScanStatus },
}

/// Bytes seen while streaming an object to the scanner.
struct Digested {
    checksum: String,
    size: u64,
}

/// Runs the scan state machine for upload-scan events.
///
/// Each event is processed under a tenant context built from the event
/// itself. Processing is safe to repeat: a redelivered event finds the file
/// record its first delivery created and either finishes the scan or does
/// nothing.
#[derive(Clone)]
pub struct ScanProcessor {
    guard: PersistenceGuard,
    storage: Arc<dyn ObjectStore>,
    scanner: Arc<dyn DynScanner>,
    recorder: MeteringRecorder,
    buffer_chunks: usize,
}

impl std::fmt::Debug for ScanProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanProcessor")
            .field("scanner", &self.scanner.name())
            .field("buffer_chunks", &self.buffer_chunks)
            .finish_non_exhaustive()
    }
}

impl ScanProcessor {
    pub fn new(
        guard: PersistenceGuard,
        storage: Arc<dyn ObjectStore>,
        scanner: Arc<dyn DynScanner>,
        recorder: MeteringRecorder,
    ) -> Self {
        Self {
            guard,
            storage,
            scanner,
            recorder,
            buffer_chunks: DEFAULT_BUFFER_CHUNKS,
        }
    }

    /// Chunks buffered between storage and scanner. Bounds memory use per
    /// scan regardless of object size.
    #[must_use]
    pub fn with_buffer_chunks(mut self, chunks: usize) -> Self {
        self.buffer_chunks = chunks.max(1);
        self
    }

    /// Decode `payload` and process it.
    pub async fn process_payload(&self, payload: &[u8]) -> Result<ScanOutcome, PipelineError> {
        let event = UploadScanEvent::from_slice(payload).map_err(|e| {
            error!(error = %e, "undecodable upload-scan event");
            PipelineError::Malformed(e.to_string())
        })?;
        self.process(&event).await
    }

    #[instrument(
        skip_all,
        fields(tenant_id = %event.tenant_id, object_key = %event.object_key)
    )]
    pub async fn process(&self, event: &UploadScanEvent) -> Result<ScanOutcome, PipelineError> {
        let ctx = FixedTenantContext::new(event.tenant_id, Some(event.uploaded_by_user_id));

        let file = match self.existing(&ctx, event).await? {
            Some(file) if file.scan_status.is_terminal() => {
                return self.settle_duplicate(file).await;
            }
            Some(file) => {
                info!(file_id = %file.id, "resuming scan of pending file");
                file
            }
            None => self.create_pending(&ctx, event).await?,
        };

        let (verdict, digest) = self.scan(&file).await?;
        if verdict.infected {
            self.quarantine(event, file, verdict, digest).await
        } else {
            let digest = digest.ok_or_else(|| PipelineError::ScanIncomplete(file.object_key.clone()))?;
            self.accept(&ctx, file, digest).await
        }
    }

    async fn existing(
        &self,
        ctx: &FixedTenantContext,
        event: &UploadScanEvent,
    ) -> Result<Option<FileRecord>, PipelineError> {
        Ok(self
            .guard
            .find_by_natural_key::<FileRecord>(ctx, &event.object_key, Visibility::IncludeDeleted)
            .await?)
    }

    async fn settle_duplicate(&self, file: FileRecord) -> Result<ScanOutcome, PipelineError> {
        warn!(file_id = %file.id, status = %file.scan_status, "duplicate delivery");
        if file.scan_status == ScanStatus::ScannedInfected {
            // The record commits before the object is deleted; finish a
            // deletion an earlier delivery may not have completed.
            self.storage
                .delete_object(&file.bucket, &file.object_key)
                .await?;
        }
        Ok(ScanOutcome::Duplicate {
            file_id: file.id,
            status: file.scan_status,
        })
    }

    async fn create_pending(
        &self,
        ctx: &FixedTenantContext,
        event: &UploadScanEvent,
    ) -> Result<FileRecord, PipelineError> {
        let info = self
            .storage
            .stat_object(&event.bucket, &event.object_key)
            .await?
            .ok_or_else(|| {
                error!("announced object does not exist");
                PipelineError::ObjectMissing {
                    bucket: event.bucket.clone(),
                    key: event.object_key.clone(),
                }
            })?;

        let pending = FileRecord::pending(
            &event.bucket,
            &event.object_key,
            &event.original_file_name,
            &event.content_type,
            info.size,
            Some(event.uploaded_by_user_id),
        );
        match self.guard.insert(ctx, pending).await {
            Ok(file) => {
                debug!(file_id = %file.id, size = file.size, "file pending scan");
                Ok(file)
            }
            Err(GuardError::Store(StoreError::UniqueViolation(detail))) => {
                // A concurrent delivery won the insert, or the key belongs to
                // another tenant and is invisible here.
                match self.existing(ctx, event).await? {
                    Some(file) => Ok(file),
                    None => Err(PipelineError::KeyConflict(detail)),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stream the object through a hashing tee into the scanner.
    ///
    /// The digest is `None` when the scanner stopped reading early, which
    /// only an infected verdict may do.
    async fn scan(
        &self,
        file: &FileRecord,
    ) -> Result<(ScanVerdict, Option<Digested>), PipelineError> {
        let (download_tx, mut download_rx) = mpsc::channel::<Bytes>(self.buffer_chunks);
        let (scan_tx, scan_rx) = mpsc::channel::<Bytes>(self.buffer_chunks);

        let download = self
            .storage
            .stream_object(&file.bucket, &file.object_key, download_tx);
        let tee = async move {
            let mut hasher = Sha256::new();
            let mut size = 0u64;
            let mut complete = true;
            while let Some(chunk) = download_rx.recv().await {
                hasher.update(&chunk);
                size += chunk.len() as u64;
                if scan_tx.send(chunk).await.is_err() {
                    complete = false;
                    break;
                }
            }
            complete.then(|| Digested {
                checksum: hex::encode(hasher.finalize()),
                size,
            })
        };
        let scan = self.scanner.scan(scan_rx);

        let (downloaded, digest, verdict) = tokio::join!(download, tee, scan);
        let verdict = verdict?;
        match downloaded {
            Ok(sent) => debug!(sent, infected = verdict.infected, "object scanned"),
            Err(StorageError::SinkClosed) if verdict.infected => {}
            Err(StorageError::SinkClosed) => {
                return Err(PipelineError::ScanIncomplete(file.object_key.clone()));
            }
            Err(StorageError::NotFound { bucket, key }) => {
                error!("object of pending file is gone");
                return Err(PipelineError::ObjectMissing { bucket, key });
            }
            Err(e) => return Err(e.into()),
        }
        Ok((verdict, digest))
    }

    async fn quarantine(
        &self,
        event: &UploadScanEvent,
        file: FileRecord,
        verdict: ScanVerdict,
        digest: Option<Digested>,
    ) -> Result<ScanOutcome, PipelineError> {
        let mut infected = file.clone();
        infected.mark_infected(
            verdict.signature.clone(),
            digest.map(|d| d.checksum),
            Utc::now(),
        )?;
        let id = infected.id.to_string();

        // Quarantine is a system action, whoever uploaded the file.
        let system = FixedTenantContext::system(event.tenant_id);
        self.guard
            .commit(
                &system,
                vec![PendingChange::Update(infected), PendingChange::Delete(id)],
            )
            .await?;
        self.storage
            .delete_object(&file.bucket, &file.object_key)
            .await?;
        warn!(
            file_id = %file.id,
            signature = verdict.signature.as_deref().unwrap_or("unknown"),
            "infected upload quarantined"
        );
        Ok(ScanOutcome::Infected {
            file_id: file.id,
            signature: verdict.signature,
        })
    }

    async fn accept(
        &self,
        ctx: &FixedTenantContext,
        file: FileRecord,
        digest: Digested,
    ) -> Result<ScanOutcome, PipelineError> {
        let size = i64::try_from(digest.size).unwrap_or(i64::MAX);
        let tenant = ctx.tenant().ok_or(GuardError::NoTenantContext)?;

        // Recorded before the status flips so a clean record always has its
        // usage event; the idempotency key absorbs a repeat after a crash.
        self.recorder
            .record(
                UsageRecord::new(
                    tenant,
                    metering::STORAGE_BYTES,
                    Decimal::from(size),
                    metering::storage_idempotency_key(&file.object_key, &digest.checksum),
                )
                .with_source(metering::SOURCE_FILE_SCAN),
            )
            .await?;

        let mut clean = file;
        clean.mark_clean(digest.checksum.clone(), size, Utc::now())?;
        let clean = self.guard.update(ctx, clean).await?;
        info!(file_id = %clean.id, size, checksum = %digest.checksum, "upload scanned clean");
        Ok(ScanOutcome::Clean {
            file_id: clean.id,
            size,
            checksum: digest.checksum,
        })
    }
}

#[async_trait]
impl MessageHandler for ScanProcessor {
    fn name(&self) -> &'static str {
        "scan"
    }

    async fn handle(&self, message: &Message) -> Result<(), PipelineError> {
        self.process_payload(&message.payload).await.map(|_| ())
    }
}
