use aws_config::{ConfigLoader, Region};
use tracing::{debug, info};

use crate::config::AwsBaseConfig;

const DEFAULT_SESSION_NAME: &str = "tenantry-worker";

/// Build an SDK configuration from the standard credential chain.
///
/// With `endpoint_url` set (MinIO, `LocalStack`) every client built from the
/// result talks to that endpoint. With `role_arn` set the role is assumed via
/// STS using the ambient credentials, and the SDK refreshes the session
/// before it expires.
///
/// ```no_run
/// use tenantry_aws::auth::build_sdk_config;
/// use tenantry_aws::config::AwsBaseConfig;
///
/// # async fn example() {
/// let config = AwsBaseConfig::new("eu-central-1").with_endpoint_url("http://localhost:9000");
/// let sdk_config = build_sdk_config(&config).await;
/// # }
/// ```
pub async fn build_sdk_config(config: &AwsBaseConfig) -> aws_config::SdkConfig {
    let Some(role_arn) = &config.role_arn else {
        return loader(config).load().await;
    };

    let session_name = config
        .session_name
        .as_deref()
        .unwrap_or(DEFAULT_SESSION_NAME);
    info!(session_name, "assuming IAM role via STS");

    let ambient = loader(config).load().await;
    let mut role = aws_config::sts::AssumeRoleProvider::builder(role_arn)
        .session_name(session_name)
        .region(Region::new(config.region.clone()));
    if let Some(external_id) = &config.external_id {
        role = role.external_id(external_id);
    }
    let credentials = role.configure(&ambient).build().await;

    loader(config).credentials_provider(credentials).load().await
}

fn loader(config: &AwsBaseConfig) -> ConfigLoader {
    let loader = aws_config::from_env().region(Region::new(config.region.clone()));
    match &config.endpoint_url {
        Some(endpoint) => {
            debug!(%endpoint, "using custom AWS endpoint");
            loader.endpoint_url(endpoint)
        }
        None => loader,
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    // Loading an SDK config needs a root certificate store, so these only
    // run in integration mode.

    #[tokio::test]
    async fn region_is_applied() {
        let sdk_config = build_sdk_config(&AwsBaseConfig::new("ap-northeast-1")).await;
        assert_eq!(
            sdk_config.region().map(|r| r.as_ref()),
            Some("ap-northeast-1")
        );
    }

    #[tokio::test]
    async fn endpoint_override_keeps_region() {
        let config = AwsBaseConfig::new("us-west-2").with_endpoint_url("http://localhost:9000");
        let sdk_config = build_sdk_config(&config).await;
        assert_eq!(sdk_config.region().map(|r| r.as_ref()), Some("us-west-2"));
    }
}
