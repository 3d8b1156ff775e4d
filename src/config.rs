//! Layered configuration (C10): embedded defaults, an optional TOML file,
//! and `PROMSCOPE_`-prefixed environment overrides, collapsed into a single
//! immutable [`Config`] value passed by reference into every constructor.
//! No component reads the environment or a process global once constructed.

use std::{path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error;

/// Top-level configuration, deserialized once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub query_ingester: QueryIngesterConfig,
    pub ingester: IngesterConfig,
    pub inventory: InventoryConfig,
    pub retention: RetentionConfig,
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            query_ingester: QueryIngesterConfig::default(),
            ingester: IngesterConfig::default(),
            inventory: InventoryConfig::default(),
            retention: RetentionConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from embedded defaults, merging an optional TOML
    /// file and then `PROMSCOPE_`-prefixed environment variables on top.
    pub fn load(file: Option<&Path>) -> Result<Self, error::Config> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("PROMSCOPE_").split("__"));
        let config: Config = figment.extract().map_err(error::Config::Parse)?;
        config.retention.validate()?;
        Ok(config)
    }
}

/// `provider ∈ {postgresql, sqlite}` plus per-engine connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DatabaseConfig {
    pub provider: DatabaseProvider,
    pub addr: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub sslmode: String,
    pub dial_timeout_secs: u64,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime_secs: u64,
    pub database_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            provider: DatabaseProvider::Sqlite,
            addr: "localhost".to_owned(),
            port: 5432,
            user: "postgres".to_owned(),
            password: String::new(),
            database: "promscope".to_owned(),
            sslmode: "disable".to_owned(),
            dial_timeout_secs: 5,
            max_open_conns: 10,
            max_idle_conns: 5,
            conn_max_lifetime_secs: 1800,
            database_path: "promscope.db".to_owned(),
        }
    }
}

impl DatabaseConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn conn_max_lifetime(&self) -> Duration {
        Duration::from_secs(self.conn_max_lifetime_secs)
    }

    /// Postgres connection string built from the discrete fields above.
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.addr, self.port, self.database, self.sslmode
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseProvider {
    Postgresql,
    Sqlite,
}

/// C3 — the query ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryIngesterConfig {
    pub buffer_size: usize,
    pub ingest_timeout_secs: u64,
    pub shutdown_grace_period_secs: u64,
    pub batch_size: usize,
    pub batch_flush_interval_millis: u64,
}

impl Default for QueryIngesterConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            ingest_timeout_secs: 5,
            shutdown_grace_period_secs: 10,
            batch_size: 200,
            batch_flush_interval_millis: 2_000,
        }
    }
}

impl QueryIngesterConfig {
    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_millis)
    }
}

/// C5/C6 — the OTLP ingress/egress filter and its catalog auto-sync buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngesterConfig {
    pub protocol: EgressProtocol,
    pub graceful_shutdown_timeout_secs: u64,
    pub drain_delay_millis: u64,
    pub allowed_jobs: Vec<String>,
    pub denied_jobs: Vec<String>,
    pub dry_run: bool,
    pub otlp: OtlpConfig,
    pub redis: RedisConfig,
    pub catalog_sync: CatalogSyncConfig,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            protocol: EgressProtocol::Otlp,
            graceful_shutdown_timeout_secs: 15,
            drain_delay_millis: 500,
            allowed_jobs: Vec::new(),
            denied_jobs: Vec::new(),
            dry_run: false,
            otlp: OtlpConfig::default(),
            redis: RedisConfig::default(),
            catalog_sync: CatalogSyncConfig::default(),
        }
    }
}

impl IngesterConfig {
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EgressProtocol {
    Otlp,
    OtlpHttp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtlpConfig {
    pub listen_address: String,
    pub downstream_address: String,
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:4317".to_owned(),
            downstream_address: "http://localhost:4318".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub url: String,
    pub ttl_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://127.0.0.1:6379".to_owned(),
            ttl_secs: 60,
        }
    }
}

impl RedisConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSyncConfig {
    pub enabled: bool,
    pub flush_interval_secs: u64,
    pub buffer_size: usize,
    pub seen_ttl_secs: u64,
}

impl Default for CatalogSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_secs: 30,
            buffer_size: 4_096,
            seen_ttl_secs: 600,
        }
    }
}

impl CatalogSyncConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn seen_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_ttl_secs)
    }
}

/// C4 — the inventory syncer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub prometheus_base_url: String,
    pub sync_interval_secs: u64,
    pub time_window_secs: u64,
    pub metadata_limit: Option<u32>,
    pub leader_election: bool,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            prometheus_base_url: "http://localhost:9090".to_owned(),
            sync_interval_secs: 300,
            time_window_secs: 30 * 24 * 3600,
            metadata_limit: None,
            leader_election: false,
        }
    }
}

impl InventoryConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.time_window_secs)
    }
}

/// C7 — the retention worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub run_timeout_secs: u64,
    pub queries_max_age_secs: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            run_timeout_secs: 120,
            queries_max_age_secs: 30 * 24 * 3600,
        }
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Rejects a non-positive `interval`/`run_timeout`/`queries_max_age`,
    /// regardless of `enabled` — a disabled worker can still be re-enabled
    /// by a later config reload without restarting.
    pub fn validate(&self) -> Result<(), error::Config> {
        if self.interval_secs == 0 {
            return Err(error::Config::Invalid("retention.interval_secs must be positive".to_owned()));
        }
        if self.run_timeout_secs == 0 {
            return Err(error::Config::Invalid("retention.run_timeout_secs must be positive".to_owned()));
        }
        if self.queries_max_age_secs <= 0 {
            return Err(error::Config::Invalid("retention.queries_max_age_secs must be positive".to_owned()));
        }
        Ok(())
    }
}

/// C11 — logging format/filter and the admin HTTP bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    pub log_filter: String,
    pub metrics_listen_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_filter: "info".to_owned(),
            metrics_listen_address: "0.0.0.0:9091".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}
