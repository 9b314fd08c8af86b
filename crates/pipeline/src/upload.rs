use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use tenantry_broker::{Publisher, SCAN_ROUTING_KEY, UPLOADS_DESTINATION};
use tenantry_core::{Actor, FileRecord, ScanStatus, TenantId, UploadScanEvent, UserId};
use tenantry_storage::{
    ObjectPut, ObjectStore, PresignedUrl, TENANT_ID_META, UPLOADED_BY_META, object_key,
    sanitize_file_name, tenant_segment,
};
use tenantry_tenancy::{GuardError, PersistenceGuard, TenantContext, Visibility};

use crate::error::PipelineError;
use crate::policy::{UploadPolicy, UploadRequest};

/// Where and how a client uploads one file directly to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    pub bucket: String,
    pub object_key: String,
    pub url: PresignedUrl,
}

/// The upload side of the pipeline: issues presigned URLs, stores
/// server-side uploads, and announces stored objects for scanning.
#[derive(Clone)]
pub struct UploadService {
    storage: Arc<dyn ObjectStore>,
    publisher: Arc<dyn Publisher>,
    guard: PersistenceGuard,
    bucket: String,
    policy: UploadPolicy,
}

impl std::fmt::Debug for UploadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadService")
            .field("bucket", &self.bucket)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn uploader(ctx: &dyn TenantContext) -> Result<(TenantId, UserId), PipelineError> {
    let tenant = ctx.tenant().ok_or(GuardError::NoTenantContext)?;
    match ctx.actor() {
        Actor::User(user) => Ok((tenant, user)),
        Actor::System => Err(PipelineError::UploadRejected(
            "uploads require an acting user".into(),
        )),
    }
}

fn object_metadata(tenant: TenantId, user: UserId) -> HashMap<String, String> {
    HashMap::from([
        (TENANT_ID_META.to_owned(), tenant.to_string()),
        (UPLOADED_BY_META.to_owned(), user.to_string()),
    ])
}

/// Original file name of a key laid out as `tenants/{tenant}/{uuid}/{name}`.
pub(crate) fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

impl UploadService {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        publisher: Arc<dyn Publisher>,
        guard: PersistenceGuard,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            publisher,
            guard,
            bucket: bucket.into(),
            policy: UploadPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: UploadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Validate `request` and issue a presigned PUT for a fresh key under the
    /// context tenant. The URL signs the tenant and uploader metadata in.
    #[instrument(skip_all, fields(file_name = %request.file_name))]
    pub async fn presign_upload(
        &self,
        ctx: &dyn TenantContext,
        request: &UploadRequest,
    ) -> Result<UploadTarget, PipelineError> {
        let (tenant, user) = uploader(ctx)?;
        let content_type = self.policy.validate(request)?;
        let key = object_key(tenant, &request.file_name);
        let url = self
            .storage
            .presign_put(
                &self.bucket,
                &key,
                &content_type,
                &object_metadata(tenant, user),
                self.policy.url_ttl(),
            )
            .await?;
        info!(tenant_id = %tenant, object_key = %key, "upload url issued");
        Ok(UploadTarget {
            bucket: self.bucket.clone(),
            object_key: key,
            url,
        })
    }

    /// Store `data` under a fresh key, then publish its scan event.
    ///
    /// If publishing fails the stored object is left in place and
    /// [`PipelineError::Incomplete`] is returned.
    #[instrument(skip_all, fields(file_name = %request.file_name, size = data.len()))]
    pub async fn store_and_announce(
        &self,
        ctx: &dyn TenantContext,
        request: &UploadRequest,
        data: Bytes,
    ) -> Result<UploadScanEvent, PipelineError> {
        let (tenant, user) = uploader(ctx)?;
        let size = i64::try_from(data.len()).unwrap_or(i64::MAX);
        let request = UploadRequest {
            size,
            ..request.clone()
        };
        let content_type = self.policy.validate(&request)?;
        let key = object_key(tenant, &request.file_name);

        self.storage
            .put_object(
                ObjectPut::new(&self.bucket, &key, &content_type, data)
                    .with_meta(TENANT_ID_META, tenant.to_string())
                    .with_meta(UPLOADED_BY_META, user.to_string()),
            )
            .await?;

        let event = UploadScanEvent {
            tenant_id: tenant,
            bucket: self.bucket.clone(),
            object_key: key,
            uploaded_by_user_id: user,
            original_file_name: sanitize_file_name(&request.file_name),
            content_type,
            size,
        };
        self.announce(&event).await?;
        Ok(event)
    }

    /// Announce an object the client uploaded through a presigned URL.
    ///
    /// The object must exist, live under the context tenant's prefix and
    /// carry that tenant in its metadata.
    #[instrument(skip_all, fields(object_key = %key))]
    pub async fn confirm_upload(
        &self,
        ctx: &dyn TenantContext,
        key: &str,
    ) -> Result<UploadScanEvent, PipelineError> {
        let (tenant, user) = uploader(ctx)?;
        let tenant_str = tenant.to_string();
        if tenant_segment(key) != Some(tenant_str.as_str()) {
            return Err(PipelineError::UploadRejected(
                "object key is outside the tenant prefix".into(),
            ));
        }
        let info = self
            .storage
            .stat_object(&self.bucket, key)
            .await?
            .ok_or_else(|| PipelineError::ObjectMissing {
                bucket: self.bucket.clone(),
                key: key.to_owned(),
            })?;
        if info.meta(TENANT_ID_META) != Some(tenant_str.as_str()) {
            return Err(PipelineError::UploadRejected(
                "object metadata does not match the tenant".into(),
            ));
        }

        let request = UploadRequest::new(
            file_name_of(key),
            info.content_type.clone().unwrap_or_default(),
            info.size,
        );
        let content_type = match self.policy.validate(&request) {
            Ok(ct) => ct,
            Err(e) => {
                // Never leave an object that breaks the policy in the bucket.
                self.storage.delete_object(&self.bucket, key).await?;
                return Err(e);
            }
        };

        let event = UploadScanEvent {
            tenant_id: tenant,
            bucket: self.bucket.clone(),
            object_key: key.to_owned(),
            uploaded_by_user_id: user,
            original_file_name: request.file_name,
            content_type,
            size: info.size,
        };
        self.announce(&event).await?;
        Ok(event)
    }

    async fn announce(&self, event: &UploadScanEvent) -> Result<(), PipelineError> {
        let payload = Bytes::from(event.to_vec()?);
        if let Err(source) = self
            .publisher
            .publish(UPLOADS_DESTINATION, SCAN_ROUTING_KEY, payload)
            .await
        {
            error!(object_key = %event.object_key, error = %source, "scan event not published");
            return Err(PipelineError::Incomplete {
                object_key: event.object_key.clone(),
                source,
            });
        }
        info!(
            tenant_id = %event.tenant_id,
            object_key = %event.object_key,
            size = event.size,
            "upload announced"
        );
        Ok(())
    }

    /// A presigned GET for a file that scanned clean.
    #[instrument(skip_all, fields(file_id = %file_id))]
    pub async fn download_url(
        &self,
        ctx: &dyn TenantContext,
        file_id: &str,
    ) -> Result<PresignedUrl, PipelineError> {
        let file = self
            .guard
            .get::<FileRecord>(ctx, file_id, Visibility::Live)
            .await?
            .ok_or_else(|| PipelineError::FileNotFound(file_id.to_owned()))?;
        if file.scan_status != ScanStatus::ScannedClean {
            return Err(PipelineError::NotDownloadable(file.scan_status));
        }
        Ok(self
            .storage
            .presign_get(&file.bucket, &file.object_key, self.policy.url_ttl())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use tenantry_broker::{
        Consumer, MemoryBroker, MemoryBrokerConfig, QueueBinding, SCAN_QUEUE, Subscription,
    };
    use tenantry_storage::MemoryObjectStore;
    use tenantry_store_memory::MemoryStore;
    use tenantry_tenancy::{FixedTenantContext, default_registry};

    use super::*;

    struct Fixture {
        service: UploadService,
        storage: MemoryObjectStore,
        broker: MemoryBroker,
        guard: PersistenceGuard,
    }

    fn fixture(bind: bool) -> Fixture {
        let storage = MemoryObjectStore::new();
        let broker = MemoryBroker::new(MemoryBrokerConfig::default());
        if bind {
            broker.bind(&QueueBinding::scan_queue());
        }
        let guard = PersistenceGuard::new(
            Arc::new(MemoryStore::new()),
            Arc::new(default_registry()),
        );
        let service = UploadService::new(
            Arc::new(storage.clone()),
            Arc::new(broker.clone()),
            guard.clone(),
            "uploads",
        );
        Fixture {
            service,
            storage,
            broker,
            guard,
        }
    }

    fn user_ctx() -> FixedTenantContext {
        FixedTenantContext::new(TenantId::generate(), Some(UserId::generate()))
    }

    #[tokio::test]
    async fn presigned_upload_signs_tenant_metadata() {
        let f = fixture(true);
        let ctx = user_ctx();
        let tenant = ctx.tenant().unwrap();
        let target = f
            .service
            .presign_upload(&ctx, &UploadRequest::new("scan 1.pdf", "application/pdf", 2048))
            .await
            .unwrap();
        assert_eq!(tenant_segment(&target.object_key), Some(tenant.to_string().as_str()));
        assert!(target.object_key.ends_with("/scan_1.pdf"));
        assert_eq!(
            target.url.headers.get("x-meta-tenant-id"),
            Some(&tenant.to_string())
        );
    }

    #[tokio::test]
    async fn system_context_cannot_upload() {
        let f = fixture(true);
        let ctx = FixedTenantContext::system(TenantId::generate());
        let err = f
            .service
            .presign_upload(&ctx, &UploadRequest::new("a.png", "image/png", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UploadRejected(_)));

        let err = f
            .service
            .presign_upload(&FixedTenantContext::empty(), &UploadRequest::new("a.png", "image/png", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Guard(GuardError::NoTenantContext)));
    }

    #[tokio::test]
    async fn store_and_announce_publishes_one_event() {
        let f = fixture(true);
        let ctx = user_ctx();
        let event = f
            .service
            .store_and_announce(
                &ctx,
                &UploadRequest::new("photo.png", "image/png", 0),
                Bytes::from_static(b"\x89PNG...."),
            )
            .await
            .unwrap();
        assert_eq!(event.size, 8);
        assert!(f.storage.contains("uploads", &event.object_key));
        assert_eq!(f.broker.ready_count(SCAN_QUEUE), 1);

        let mut sub = f.broker.subscribe(SCAN_QUEUE, 1).await.unwrap();
        let delivery = sub.next().await.unwrap().unwrap();
        assert_eq!(UploadScanEvent::from_slice(delivery.payload()).unwrap(), event);
    }

    #[tokio::test]
    async fn unroutable_publish_is_incomplete() {
        let f = fixture(false);
        let err = f
            .service
            .store_and_announce(
                &user_ctx(),
                &UploadRequest::new("doc.pdf", "application/pdf", 0),
                Bytes::from_static(b"%PDF"),
            )
            .await
            .unwrap_err();
        let PipelineError::Incomplete { object_key, .. } = err else {
            panic!("expected incomplete, got {err:?}");
        };
        assert!(f.storage.contains("uploads", &object_key));
    }

    #[tokio::test]
    async fn confirm_checks_tenant_prefix_and_metadata() {
        let f = fixture(true);
        let ctx = user_ctx();
        let target = f
            .service
            .presign_upload(&ctx, &UploadRequest::new("a.jpg", "image/jpeg", 3))
            .await
            .unwrap();
        f.storage
            .upload_presigned(&target.url, Bytes::from_static(b"jpg"))
            .unwrap();

        let other = user_ctx();
        let err = f
            .service
            .confirm_upload(&other, &target.object_key)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UploadRejected(_)));

        let event = f.service.confirm_upload(&ctx, &target.object_key).await.unwrap();
        assert_eq!(event.original_file_name, "a.jpg");
        assert_eq!(event.size, 3);
        assert_eq!(f.broker.ready_count(SCAN_QUEUE), 1);
    }

    #[tokio::test]
    async fn only_clean_files_are_downloadable() {
        let f = fixture(true);
        let ctx = user_ctx();
        let file = f
            .guard
            .insert(
                &ctx,
                FileRecord::pending("uploads", "tenants/x/1/a.pdf", "a.pdf", "application/pdf", 4, None),
            )
            .await
            .unwrap();
        let id = file.id.to_string();

        let err = f.service.download_url(&ctx, &id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotDownloadable(ScanStatus::PendingScan)));

        let mut clean = file.clone();
        clean.mark_clean("abc", 4, chrono::Utc::now()).unwrap();
        f.guard.update(&ctx, clean).await.unwrap();
        let url = f.service.download_url(&ctx, &id).await.unwrap();
        assert_eq!(url.method, "GET");

        let err = f.service.download_url(&user_ctx(), &id).await.unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound(_)));
    }
}
