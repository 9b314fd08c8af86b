//! Object key layout: `tenants/{tenant_id}/{uuid}/{file_name}`.

use std::fmt::Display;

use uuid::Uuid;

const MAX_FILE_NAME: usize = 128;

/// A fresh, collision-free key for a file uploaded by `tenant`.
pub fn object_key(tenant: impl Display, file_name: &str) -> String {
    format!(
        "tenants/{tenant}/{}/{}",
        Uuid::new_v4(),
        sanitize_file_name(file_name)
    )
}

/// Reduce a client-supplied file name to a safe key segment.
///
/// Directory components are dropped and anything outside `[A-Za-z0-9._-]`
/// becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME)
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// The tenant segment of a key laid out by [`object_key`].
pub fn tenant_segment(key: &str) -> Option<&str> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next()) {
        (Some("tenants"), Some(tenant)) if !tenant.is_empty() => Some(tenant),
        _ => None,
    }
}
