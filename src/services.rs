//! Wires the storage Provider, metrics registry, and C3 ingester together
//! into one value constructed once at startup and handed to every task.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{Config, DatabaseConfig, DatabaseProvider};
use crate::ingest::Ingester;
use crate::observability::Metrics;
use crate::storage::postgres::PostgresProvider;
use crate::storage::sqlite::SqliteProvider;
use crate::storage::{self, Provider};
use crate::{error, ingest};

pub struct Services {
    pub provider: Arc<dyn Provider>,
    pub metrics: Arc<Metrics>,
    pub ingester: Ingester,
}

impl Services {
    /// Opens and migrates the Provider, builds the metrics registry, and
    /// spawns C3's ingestion worker. Returns the bundle plus that worker's
    /// join handle so `main` can fold it into the shutdown join set.
    pub async fn build(
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), error::Main> {
        let provider = open_provider(&config.database).await.map_err(error::Main::Storage)?;
        provider.migrate().await.map_err(error::Main::Storage)?;
        let provider: Arc<dyn Provider> = Arc::from(provider);

        let metrics = Arc::new(Metrics::new()?);

        let (ingester, ingest_handle) =
            ingest::spawn(config.query_ingester.clone(), provider.clone(), metrics.clone(), shutdown);

        Ok((Self { provider, metrics, ingester }, ingest_handle))
    }
}

async fn open_provider(config: &DatabaseConfig) -> Result<Box<dyn Provider>, storage::Error> {
    match config.provider {
        DatabaseProvider::Postgresql => {
            Ok(Box::new(PostgresProvider::connect(&config.postgres_url(), config.max_open_conns).await?))
        }
        DatabaseProvider::Sqlite => Ok(Box::new(SqliteProvider::connect(&config.database_path).await?)),
    }
}
