//! Usage events, their rollups and overage charges.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::TenantId;

/// Metered dimensions and sources known to the core.
pub mod metering {
    /// Bytes of clean, retained object storage.
    pub const STORAGE_BYTES: &str = "storage_bytes";

    /// Source tag for usage emitted by a clean scan.
    pub const SOURCE_FILE_SCAN: &str = "file_scan_clean";

    /// Idempotency key for the storage charge of one scanned object.
    ///
    /// Keyed on the object and its content so a redelivered scan of the same
    /// bytes lands on the same key.
    pub fn storage_idempotency_key(object_key: &str, checksum: &str) -> String {
        format!("scan:{object_key}:{checksum}")
    }
}

/// An immutable record of metered usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub key: String,
    pub quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        tenant_id: TenantId,
        key: impl Into<String>,
        quantity: Decimal,
        source: impl Into<String>,
        idempotency_key: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            key: key.into(),
            quantity,
            occurred_at,
            source: source.into(),
            idempotency_key: idempotency_key.into(),
            created_at: Utc::now(),
        }
    }

    /// UTC calendar day the event counts toward.
    pub fn day(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDaily {
    pub tenant_id: TenantId,
    pub key: String,
    pub day: NaiveDate,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub tenant_id: TenantId,
    pub key: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub quantity: Decimal,
    pub closed: bool,
}

/// A charge for usage beyond the plan limit in a closed period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overage {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub subscription_id: Uuid,
    pub feature_key: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub quantity_used: Decimal,
    pub quantity_over: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Overage {
    /// Compute the overage for a period against a plan limit and price.
    ///
    /// Returns `None` when usage is within the limit or the price is not
    /// positive.
    pub fn compute(
        period: &UsagePeriod,
        subscription_id: Uuid,
        limit: i64,
        unit_price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if unit_price <= Decimal::ZERO {
            return None;
        }
        let over = period.quantity - Decimal::from(limit);
        if over <= Decimal::ZERO {
            return None;
        }
        Some(Self {
            id: Uuid::now_v7(),
            tenant_id: period.tenant_id,
            subscription_id,
            feature_key: period.key.clone(),
            period_start: period.period_start,
            period_end: period.period_end,
            quantity_used: period.quantity,
            quantity_over: over,
            unit_price,
            amount: over * unit_price,
            created_at: now,
        })
    }
}

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
