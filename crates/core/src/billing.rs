//! Plans, subscriptions and per-tenant feature limits.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{AuditStamp, Entity};
use crate::types::TenantId;

/// A sellable plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            active: true,
        }
    }
}

/// A plan-level limit for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeature {
    pub plan_id: Uuid,
    pub feature_key: String,
    /// Included quantity for a billing period.
    pub limit_value: i64,
    /// Price per unit beyond `limit_value`. `None` or zero means no overage billing.
    pub overage_price: Option<Decimal>,
}

impl PlanFeature {
    pub fn new(plan_id: Uuid, feature_key: impl Into<String>, limit_value: i64) -> Self {
        Self {
            plan_id,
            feature_key: feature_key.into(),
            limit_value,
            overage_price: None,
        }
    }

    #[must_use]
    pub fn with_overage_price(mut self, price: Decimal) -> Self {
        self.overage_price = Some(price);
        self
    }

    /// Overage price when it is strictly positive.
    pub fn billable_price(&self) -> Option<Decimal> {
        self.overage_price.filter(|p| *p > Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "canceled" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant's subscription to a plan, with its current billing window
/// `[billing_period_start, billing_period_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub billing_period_start: NaiveDate,
    pub billing_period_end: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn active(
        tenant_id: TenantId,
        plan_id: Uuid,
        billing_period_start: NaiveDate,
        billing_period_end: NaiveDate,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            plan_id,
            status: SubscriptionStatus::Active,
            billing_period_start,
            billing_period_end,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Whether `day` falls in the current billing window.
    pub fn covers(&self, day: NaiveDate) -> bool {
        day >= self.billing_period_start && day < self.billing_period_end
    }
}

/// A tenant-specific limit that takes precedence over the plan's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureOverride {
    pub id: Uuid,
    pub tenant_id: Option<TenantId>,
    pub feature_key: String,
    pub limit_value: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[serde(default)]
    pub audit: AuditStamp,
}

impl FeatureOverride {
    pub fn new(feature_key: impl Into<String>, limit_value: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id: None,
            feature_key: feature_key.into(),
            limit_value,
            expires_at: None,
            notes: None,
            audit: AuditStamp::default(),
        }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// An override without expiry never lapses.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|exp| exp > now)
    }
}

impl Entity for FeatureOverride {
    const KIND: &'static str = "feature_override";

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn natural_key(&self) -> Option<String> {
        self.tenant_id
            .map(|tenant| format!("{tenant}:{}", self.feature_key))
    }
}

/// Per-day counter behind the quota gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub tenant_id: TenantId,
    pub feature_key: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub usage: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn subscription_window_is_half_open() {
        let sub = Subscription::active(
            TenantId::generate(),
            Uuid::now_v7(),
            day(2026, 3, 1),
            day(2026, 4, 1),
        );
        assert!(sub.covers(day(2026, 3, 1)));
        assert!(sub.covers(day(2026, 3, 31)));
        assert!(!sub.covers(day(2026, 4, 1)));
        assert!(!sub.covers(day(2026, 2, 28)));
    }

    #[test]
    fn override_expiry() {
        let now = Utc::now();
        let open = FeatureOverride::new("storage_bytes", 200);
        assert!(open.is_active_at(now));

        let expired = FeatureOverride::new("storage_bytes", 200).with_expiry(now - Duration::hours(1));
        assert!(!expired.is_active_at(now));

        let future = FeatureOverride::new("storage_bytes", 200).with_expiry(now + Duration::hours(1));
        assert!(future.is_active_at(now));
    }

    #[test]
    fn billable_price_ignores_zero() {
        let plan = Uuid::now_v7();
        assert!(PlanFeature::new(plan, "k", 1).billable_price().is_none());
        assert!(
            PlanFeature::new(plan, "k", 1)
                .with_overage_price(Decimal::ZERO)
                .billable_price()
                .is_none()
        );
        assert_eq!(
            PlanFeature::new(plan, "k", 1)
                .with_overage_price(Decimal::new(1, 2))
                .billable_price(),
            Some(Decimal::new(1, 2))
        );
    }

    #[test]
    fn status_parse_roundtrip() {
        for s in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(SubscriptionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SubscriptionStatus::parse("paused"), None);
    }
}
