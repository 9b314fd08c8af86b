use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TenantId;

/// An isolated customer account. Tenants are deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TenantId::generate(),
            name: name.into(),
            active: true,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }
}
