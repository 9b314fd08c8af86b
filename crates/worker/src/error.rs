use thiserror::Error;

/// Errors that stop the worker or one of its commands.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("worker task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Store(#[from] tenantry_store::StoreError),

    #[error(transparent)]
    Pipeline(#[from] tenantry_pipeline::PipelineError),

    #[error(transparent)]
    Metering(#[from] tenantry_metering::MeteringError),

    #[error(transparent)]
    Entitlement(#[from] tenantry_entitlements::EntitlementError),

    #[error(transparent)]
    Core(#[from] tenantry_core::CoreError),
}
