use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! newtype_uuid {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID.
            #[must_use]
            pub const fn new(value: Uuid) -> Self {
                Self(value)
            }

            /// Generate a fresh, time-ordered identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// `true` for the all-zero UUID, which is never a valid identity.
            #[must_use]
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|e| CoreError::InvalidId(format!("{s}: {e}")))
            }
        }
    };
}

newtype_uuid!(TenantId, "An isolated customer account identifier.");
newtype_uuid!(UserId, "Identifies the user on whose behalf a unit of work runs.");

/// Who performed a write, as recorded in audit fields and the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Actor {
    /// A known user.
    User(UserId),
    /// Background work with no user attached (scans, jobs).
    System,
}

impl Actor {
    /// Actor string used in audit columns.
    pub const SYSTEM: &'static str = "system";

    /// Render the actor the way audit fields store it.
    #[must_use]
    pub fn audit_name(&self) -> String {
        match self {
            Self::User(id) => id.to_string(),
            Self::System => Self::SYSTEM.to_owned(),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "{id}"),
            Self::System => f.write_str(Self::SYSTEM),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_parse_and_display() {
        let raw = "0190f5a2-8c1e-7cc0-9a5e-1f2b3c4d5e6f";
        let id: TenantId = raw.parse().unwrap();
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn tenant_id_parse_rejects_garbage() {
        let err = "not-a-uuid".parse::<TenantId>().unwrap_err();
        assert!(err.to_string().contains("not-a-uuid"));
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(TenantId::generate(), TenantId::generate());
        assert!(!UserId::generate().is_nil());
    }

    #[test]
    fn nil_is_detected() {
        assert!(TenantId::new(Uuid::nil()).is_nil());
    }

    #[test]
    fn serde_is_transparent() {
        let id = TenantId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn actor_audit_name() {
        assert_eq!(Actor::System.audit_name(), "system");
        let user = UserId::generate();
        assert_eq!(Actor::User(user).audit_name(), user.to_string());
    }
}
