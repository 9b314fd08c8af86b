//! Sources for the active tenant of a unit of work.
//!
//! A context is created per request or per consumed message and passed down
//! explicitly; nothing here is process-global. Missing, malformed and nil
//! identifiers all resolve to the empty context.

use std::fmt;

use tenantry_core::{Actor, TenantId, UserId};

/// Request header carrying the tenant id.
pub const TENANT_HEADER: &str = "x-tenant-id";
/// Request header carrying the acting user id.
pub const USER_HEADER: &str = "x-user-id";
/// Claim carrying the tenant id.
pub const TENANT_CLAIM: &str = "tenant_id";
/// Claim carrying the acting user id.
pub const USER_CLAIM: &str = "sub";

/// Resolves the tenant and acting user for the current unit of work.
pub trait TenantContext: Send + Sync + fmt::Debug {
    /// The active tenant, or `None` for the empty context.
    fn tenant(&self) -> Option<TenantId>;

    /// Who performs the writes of this unit of work.
    fn actor(&self) -> Actor;
}

fn parse_tenant(raw: Option<&str>) -> Option<TenantId> {
    raw.and_then(|s| s.parse::<TenantId>().ok())
        .filter(|t| !t.is_nil())
}

fn parse_user(raw: Option<&str>) -> Option<UserId> {
    raw.and_then(|s| s.parse::<UserId>().ok())
        .filter(|u| !u.is_nil())
}

fn actor_of(user: Option<UserId>) -> Actor {
    user.map_or(Actor::System, Actor::User)
}

/// A context fixed at construction. Used by the worker, which takes the
/// tenant from each message rather than from ambient state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedTenantContext {
    tenant: Option<TenantId>,
    user: Option<UserId>,
}

impl FixedTenantContext {
    pub fn new(tenant: TenantId, user: Option<UserId>) -> Self {
        Self {
            tenant: Some(tenant).filter(|t| !t.is_nil()),
            user: user.filter(|u| !u.is_nil()),
        }
    }

    /// Writes attributed to `"system"`.
    pub fn system(tenant: TenantId) -> Self {
        Self::new(tenant, None)
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl TenantContext for FixedTenantContext {
    fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    fn actor(&self) -> Actor {
        actor_of(self.user)
    }
}

/// Context read from request headers (`x-tenant-id`, `x-user-id`).
///
/// Header names match case-insensitively; the first occurrence wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderTenantContext {
    tenant: Option<TenantId>,
    user: Option<UserId>,
}

impl HeaderTenantContext {
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut tenant = None;
        let mut user = None;
        for (name, value) in headers {
            if tenant.is_none() && name.eq_ignore_ascii_case(TENANT_HEADER) {
                tenant = Some(value);
            } else if user.is_none() && name.eq_ignore_ascii_case(USER_HEADER) {
                user = Some(value);
            }
        }
        Self {
            tenant: parse_tenant(tenant),
            user: parse_user(user),
        }
    }
}

impl TenantContext for HeaderTenantContext {
    fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    fn actor(&self) -> Actor {
        actor_of(self.user)
    }
}

/// Context read from decoded token claims (`tenant_id`, `sub`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimsTenantContext {
    tenant: Option<TenantId>,
    user: Option<UserId>,
}

impl ClaimsTenantContext {
    pub fn from_claims(claims: &serde_json::Value) -> Self {
        let claim = |name: &str| claims.get(name).and_then(serde_json::Value::as_str);
        Self {
            tenant: parse_tenant(claim(TENANT_CLAIM)),
            user: parse_user(claim(USER_CLAIM)),
        }
    }
}

impl TenantContext for ClaimsTenantContext {
    fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    fn actor(&self) -> Actor {
        actor_of(self.user)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn fixed_context_with_user() {
        let tenant = TenantId::generate();
        let user = UserId::generate();
        let ctx = FixedTenantContext::new(tenant, Some(user));
        assert_eq!(ctx.tenant(), Some(tenant));
        assert_eq!(ctx.actor(), Actor::User(user));
    }

    #[test]
    fn fixed_nil_tenant_is_empty() {
        let ctx = FixedTenantContext::new(TenantId::new(Uuid::nil()), None);
        assert_eq!(ctx.tenant(), None);
        assert_eq!(ctx.actor(), Actor::System);
        assert_eq!(FixedTenantContext::empty().tenant(), None);
    }

    #[test]
    fn headers_case_insensitive() {
        let tenant = TenantId::generate();
        let user = UserId::generate();
        let (t, u) = (tenant.to_string(), user.to_string());
        let ctx = HeaderTenantContext::from_headers([
            ("X-Tenant-Id", t.as_str()),
            ("content-type", "application/json"),
            ("X-USER-ID", u.as_str()),
        ]);
        assert_eq!(ctx.tenant(), Some(tenant));
        assert_eq!(ctx.actor().audit_name(), user.to_string());
    }

    #[test]
    fn malformed_header_is_empty() {
        let ctx = HeaderTenantContext::from_headers([("x-tenant-id", "acme")]);
        assert_eq!(ctx.tenant(), None);
        let ctx = HeaderTenantContext::from_headers(std::iter::empty());
        assert_eq!(ctx.tenant(), None);
    }

    #[test]
    fn claims_resolve_tenant_and_subject() {
        let tenant = TenantId::generate();
        let user = UserId::generate();
        let claims = serde_json::json!({
            "tenant_id": tenant.to_string(),
            "sub": user.to_string(),
            "exp": 0,
        });
        let ctx = ClaimsTenantContext::from_claims(&claims);
        assert_eq!(ctx.tenant(), Some(tenant));
        assert_eq!(ctx.actor(), Actor::User(user));
    }

    #[test]
    fn claims_without_tenant_are_empty() {
        let ctx = ClaimsTenantContext::from_claims(&serde_json::json!({ "tenant_id": 7 }));
        assert_eq!(ctx.tenant(), None);
        assert_eq!(ctx.actor(), Actor::System);
    }
}
