use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use tenantry_core::{TenantId, UsageEvent};
use tenantry_store::{InsertOutcome, MeteringStore};

use crate::error::MeteringError;

/// One usage observation to record.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub tenant_id: TenantId,
    pub key: String,
    pub quantity: Decimal,
    pub source: String,
    pub idempotency_key: String,
    /// Defaults to the time of recording.
    pub occurred_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn new(
        tenant_id: TenantId,
        key: impl Into<String>,
        quantity: Decimal,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            key: key.into(),
            quantity,
            source: "api".to_owned(),
            idempotency_key: idempotency_key.into(),
            occurred_at: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    fn validate(&self) -> Result<(), MeteringError> {
        if self.tenant_id.is_nil() {
            return Err(MeteringError::InvalidRecord("tenant id is nil".into()));
        }
        if self.key.trim().is_empty() {
            return Err(MeteringError::InvalidRecord("key is empty".into()));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(MeteringError::InvalidRecord(
                "idempotency key is empty".into(),
            ));
        }
        Ok(())
    }
}

/// Appends usage events.
///
/// Recording the same `(tenant, key, idempotency_key)` twice is not an
/// error: the second call stores nothing and returns
/// [`InsertOutcome::Duplicate`]. Callers never need to check first.
#[derive(Clone)]
pub struct MeteringRecorder {
    store: Arc<dyn MeteringStore>,
}

impl std::fmt::Debug for MeteringRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteringRecorder").finish_non_exhaustive()
    }
}

impl MeteringRecorder {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }

    #[instrument(
        skip_all,
        fields(tenant_id = %record.tenant_id, key = %record.key, idempotency_key = %record.idempotency_key)
    )]
    pub async fn record(&self, record: UsageRecord) -> Result<InsertOutcome, MeteringError> {
        record.validate()?;
        let event = UsageEvent::new(
            record.tenant_id,
            record.key,
            record.quantity,
            record.source,
            record.idempotency_key,
            record.occurred_at.unwrap_or_else(Utc::now),
        );
        let outcome = self.store.insert_usage_event(&event).await?;
        match outcome {
            InsertOutcome::Inserted => debug!(quantity = %event.quantity, "usage recorded"),
            InsertOutcome::Duplicate => warn!("duplicate usage event ignored"),
        }
        Ok(outcome)
    }
}
