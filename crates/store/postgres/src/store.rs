use std::sync::Arc;

use sqlx::PgPool;

use tenantry_store::error::StoreError;

use crate::config::PostgresConfig;
use crate::migrations;

/// Build `PgConnectOptions` from a [`PostgresConfig`], applying SSL settings
/// when configured.
pub(crate) fn build_connect_options(
    config: &PostgresConfig,
) -> Result<sqlx::postgres::PgConnectOptions, StoreError> {
    let mut options: sqlx::postgres::PgConnectOptions = config
        .url
        .parse()
        .map_err(|e: sqlx::Error| StoreError::Connection(e.to_string()))?;

    if let Some(ref mode) = config.ssl_mode {
        let ssl_mode = match mode.as_str() {
            "disable" => sqlx::postgres::PgSslMode::Disable,
            "prefer" => sqlx::postgres::PgSslMode::Prefer,
            "require" => sqlx::postgres::PgSslMode::Require,
            "verify-ca" => sqlx::postgres::PgSslMode::VerifyCa,
            "verify-full" => sqlx::postgres::PgSslMode::VerifyFull,
            other => {
                return Err(StoreError::Connection(format!("unknown ssl_mode: {other}")));
            }
        };
        options = options.ssl_mode(ssl_mode);
    }
    if let Some(ref path) = config.ssl_root_cert {
        options = options.ssl_root_cert(path);
    }
    if let Some(ref path) = config.ssl_cert {
        options = options.ssl_client_cert(path);
    }
    if let Some(ref path) = config.ssl_key {
        options = options.ssl_client_key(path);
    }
    Ok(options)
}

/// Open a pool for `config` without touching the schema.
pub(crate) async fn connect(config: &PostgresConfig) -> Result<PgPool, StoreError> {
    let connect_options = build_connect_options(config)?;
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect_with(connect_options)
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))
}

/// PostgreSQL-backed row, metering and billing store.
///
/// Every table lives under `schema.prefix*`. Multi-statement operations run
/// in a single database transaction.
#[derive(Clone)]
pub struct PostgresStore {
    pub(crate) pool: PgPool,
    pub(crate) config: Arc<PostgresConfig>,
}

impl PostgresStore {
    /// Connect and run migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if pool creation fails, or
    /// [`StoreError::Backend`] if migrations fail.
    pub async fn new(config: PostgresConfig) -> Result<Self, StoreError> {
        let pool = connect(&config).await?;
        Self::from_pool(pool, config).await
    }

    /// Wrap an existing pool, running migrations first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if migrations fail.
    pub async fn from_pool(pool: PgPool, config: PostgresConfig) -> Result<Self, StoreError> {
        migrations::run_migrations(&pool, &config)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    /// Connect without running migrations. The schema must already exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if pool creation fails.
    pub async fn connect_existing(config: PostgresConfig) -> Result<Self, StoreError> {
        let pool = connect(&config).await?;
        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    /// The underlying pool, for sharing with [`PostgresDistributedLock`](crate::PostgresDistributedLock).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("schema", &self.config.schema)
            .field("table_prefix", &self.config.table_prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_ssl_mode() {
        let cfg = PostgresConfig {
            ssl_mode: Some("sometimes".into()),
            ..PostgresConfig::default()
        };
        let err = build_connect_options(&cfg).unwrap_err();
        assert!(err.to_string().contains("unknown ssl_mode"));
    }

    #[test]
    fn accepts_known_ssl_mode() {
        let cfg = PostgresConfig {
            ssl_mode: Some("require".into()),
            ..PostgresConfig::default()
        };
        assert!(build_connect_options(&cfg).is_ok());
    }
}
