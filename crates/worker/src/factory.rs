//! Backend construction from configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use tenantry_broker::{Consumer, MemoryBroker, MemoryBrokerConfig, Publisher};
use tenantry_core::RetryStrategy;
use tenantry_scanner::{ClamdConfig, ClamdScanner, DynScanner, SignatureScanner};
use tenantry_storage::{MemoryObjectStore, ObjectStore};
use tenantry_store::{BillingStore, DistributedLock, MeteringStore, RowStore};
use tenantry_store_memory::{MemoryDistributedLock, MemoryStore};

use crate::config::{BrokerConfig, DatabaseConfig, ScannerConfig, StorageConfig};
use crate::error::WorkerError;

/// Every store trait, backed by one database.
#[derive(Clone)]
pub struct Stores {
    pub rows: Arc<dyn RowStore>,
    pub metering: Arc<dyn MeteringStore>,
    pub billing: Arc<dyn BillingStore>,
    pub lock: Arc<dyn DistributedLock>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

fn unknown(section: &str, backend: &str) -> WorkerError {
    WorkerError::Config(format!(
        "unknown {section} backend: {backend} (is the feature enabled?)"
    ))
}

/// Create the stores. The Postgres backend migrates its schema on connect.
#[allow(clippy::unused_async)]
pub async fn create_stores(config: &DatabaseConfig) -> Result<Stores, WorkerError> {
    match config.backend.as_str() {
        "memory" => {
            let store = MemoryStore::new();
            Ok(Stores {
                rows: Arc::new(store.clone()),
                metering: Arc::new(store.clone()),
                billing: Arc::new(store),
                lock: Arc::new(MemoryDistributedLock::new()),
            })
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            let store = tenantry_store_postgres::PostgresStore::new(postgres_config(config)?).await?;
            let lock = tenantry_store_postgres::PostgresDistributedLock::from_store(&store);
            Ok(Stores {
                rows: Arc::new(store.clone()),
                metering: Arc::new(store.clone()),
                billing: Arc::new(store),
                lock: Arc::new(lock),
            })
        }
        other => Err(unknown("database", other)),
    }
}

#[cfg(feature = "postgres")]
fn postgres_config(
    config: &DatabaseConfig,
) -> Result<tenantry_store_postgres::PostgresConfig, WorkerError> {
    let url = config.url.as_deref().ok_or_else(|| {
        WorkerError::Config("postgres backend requires [database] url".into())
    })?;
    let mut pg = tenantry_store_postgres::PostgresConfig::default().with_url(url);
    if let Some(pool_size) = config.pool_size {
        pg.pool_size = pool_size;
    }
    if let Some(schema) = &config.schema {
        pg.schema.clone_from(schema);
    }
    if let Some(prefix) = &config.table_prefix {
        pg = pg.with_table_prefix(prefix);
    }
    Ok(pg)
}

/// Create or upgrade the database schema.
pub async fn migrate(config: &DatabaseConfig) -> Result<(), WorkerError> {
    match config.backend.as_str() {
        "memory" => {
            info!("memory backend has no schema, nothing to migrate");
            Ok(())
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            tenantry_store_postgres::PostgresStore::new(postgres_config(config)?).await?;
            info!("postgres migrations complete");
            Ok(())
        }
        other => Err(unknown("database", other)),
    }
}

#[allow(clippy::unused_async)]
pub async fn create_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, WorkerError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryObjectStore::new())),
        #[cfg(feature = "aws")]
        "s3" => {
            let region = config.region.clone().ok_or_else(|| {
                WorkerError::Config("s3 backend requires [storage] region".into())
            })?;
            let mut s3 = tenantry_aws::S3Config::new(region)
                .with_force_path_style(config.force_path_style);
            if let Some(endpoint) = &config.endpoint_url {
                s3 = s3.with_endpoint_url(endpoint);
            }
            Ok(Arc::new(tenantry_aws::S3ObjectStore::new(&s3).await))
        }
        other => Err(unknown("storage", other)),
    }
}

/// Both halves of a broker connection.
#[derive(Clone)]
pub struct Broker {
    pub publisher: Arc<dyn Publisher>,
    pub consumer: Arc<dyn Consumer>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

#[allow(clippy::unused_async)]
pub async fn create_broker(config: &BrokerConfig) -> Result<Broker, WorkerError> {
    match config.backend.as_str() {
        "memory" => {
            let broker = MemoryBroker::new(
                MemoryBrokerConfig::default().with_max_deliveries(config.max_deliveries),
            );
            Ok(Broker {
                publisher: Arc::new(broker.clone()),
                consumer: Arc::new(broker),
            })
        }
        #[cfg(feature = "aws")]
        "sqs" => {
            let region = config.region.clone().ok_or_else(|| {
                WorkerError::Config("sqs backend requires [broker] region".into())
            })?;
            let mut sqs = tenantry_aws::SqsConfig::new(region);
            if let Some(endpoint) = &config.endpoint_url {
                sqs = sqs.with_endpoint_url(endpoint);
            }
            if let Some(wait) = config.wait_time_seconds {
                sqs = sqs.with_wait_time_seconds(wait);
            }
            for (queue, url) in &config.queue_urls {
                sqs = sqs.with_queue_url(queue, url);
            }
            let broker = tenantry_aws::SqsBroker::new(sqs).await;
            Ok(Broker {
                publisher: Arc::new(broker.clone()),
                consumer: Arc::new(broker),
            })
        }
        other => Err(unknown("broker", other)),
    }
}

pub fn create_scanner(config: &ScannerConfig) -> Result<Arc<dyn DynScanner>, WorkerError> {
    match config.backend.as_str() {
        "clamd" => {
            let mut clamd = ClamdConfig::new(&config.host, config.port)
                .with_chunk_size(config.chunk_size)
                .with_connect_attempts(config.connect_attempts, RetryStrategy::default())
                .with_reply_timeout(Duration::from_secs(config.reply_timeout_seconds));
            clamd.connect_timeout = Duration::from_secs(config.connect_timeout_seconds);
            Ok(Arc::new(ClamdScanner::new(clamd)))
        }
        "signature" => Ok(Arc::new(SignatureScanner::default())),
        other => Err(unknown("scanner", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backends_build() {
        create_stores(&DatabaseConfig::default()).await.unwrap();
        create_object_store(&StorageConfig::default()).await.unwrap();
        create_broker(&BrokerConfig::default()).await.unwrap();
        let scanner = create_scanner(&ScannerConfig::default()).unwrap();
        assert_eq!(scanner.name(), "clamd");
    }

    #[tokio::test]
    async fn unknown_backend_names_the_section() {
        let config = DatabaseConfig {
            backend: "cassandra".into(),
            ..DatabaseConfig::default()
        };
        let err = create_stores(&config).await.unwrap_err();
        assert!(err.to_string().contains("unknown database backend: cassandra"));

        let config = ScannerConfig {
            backend: "sophos".into(),
            ..ScannerConfig::default()
        };
        assert!(matches!(create_scanner(&config), Err(WorkerError::Config(_))));
    }
}
