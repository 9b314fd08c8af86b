use serde::{Deserialize, Serialize};

/// Region, endpoint and credential settings shared by the S3 and SQS
/// backends.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsBaseConfig {
    pub region: String,

    /// IAM role to assume via STS.
    pub role_arn: Option<String>,

    /// Endpoint override for S3/SQS compatible services (MinIO,
    /// `LocalStack`, `ElasticMQ`).
    pub endpoint_url: Option<String>,

    /// STS session name, `tenantry-worker` when unset.
    pub session_name: Option<String>,

    /// External id required by the role's trust policy.
    pub external_id: Option<String>,
}

impl std::fmt::Debug for AwsBaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsBaseConfig")
            .field("region", &self.region)
            .field("role_arn", &self.role_arn.as_ref().map(|_| "[REDACTED]"))
            .field("endpoint_url", &self.endpoint_url)
            .field("session_name", &self.session_name)
            .field("external_id", &self.external_id.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl AwsBaseConfig {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_role_arn(mut self, role_arn: impl Into<String>) -> Self {
        self.role_arn = Some(role_arn.into());
        self
    }

    #[must_use]
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    #[must_use]
    pub fn with_session_name(mut self, session_name: impl Into<String>) -> Self {
        self.session_name = Some(session_name.into());
        self
    }

    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

impl Default for AwsBaseConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_owned(),
            role_arn: None,
            endpoint_url: None,
            session_name: None,
            external_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_keeps_other_defaults() {
        let config = AwsBaseConfig::new("eu-west-1");
        assert_eq!(config.region, "eu-west-1");
        assert!(config.role_arn.is_none());
        assert!(config.endpoint_url.is_none());
    }

    #[test]
    fn debug_redacts_role_and_external_id() {
        let config = AwsBaseConfig::new("us-east-1")
            .with_role_arn("arn:aws:iam::123456789012:role/scan")
            .with_external_id("shared-secret");
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("123456789012"));
        assert!(!debug.contains("shared-secret"));
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: AwsBaseConfig =
            serde_json::from_str(r#"{"endpoint_url":"http://minio:9000"}"#).unwrap();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.endpoint_url.as_deref(), Some("http://minio:9000"));
    }
}
