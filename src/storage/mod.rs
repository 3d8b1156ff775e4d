//! Storage Provider abstraction (C2): one async trait implemented over
//! Postgres and SQLite, selected at startup by [`crate::config::DatabaseProvider`].

pub mod error;
pub mod postgres;
pub mod sqlite;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::Error;
pub use types::*;

use crate::timerange::TimeRange;

/// The single polymorphism surface for storage: every read and write the
/// rest of the crate needs goes through this trait, dynamically dispatched
/// via `Arc<dyn Provider>` so the ingestion, inventory, catalog and
/// retention tasks never know which SQL dialect backs them.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Runs embedded schema migrations. Called once at startup.
    async fn migrate(&self) -> Result<(), Error>;

    /// Cheap liveness probe for the admin `/readyz` handler.
    async fn ping(&self) -> Result<(), Error>;

    async fn insert_queries(&self, items: &[NewQuery]) -> Result<(), Error>;
    async fn insert_rules_usage(&self, items: &[RulesUsageItem]) -> Result<(), Error>;
    async fn insert_dashboard_usage(&self, items: &[DashboardUsageItem]) -> Result<(), Error>;
    async fn upsert_metrics_catalog(&self, items: &[CatalogItem]) -> Result<(), Error>;
    async fn upsert_metrics_job_index(&self, items: &[JobIndexItem]) -> Result<(), Error>;

    /// Recomputes the `metrics_usage_summary` materialised rollup for `tr`.
    async fn refresh_metrics_usage_summary(&self, tr: TimeRange) -> Result<(), Error>;

    /// Deletes `queries` rows older than `cutoff`. Returns rows removed.
    async fn delete_queries_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error>;

    async fn get_query_types(&self, tr: TimeRange, fingerprint: Option<&str>) -> Result<QueryTypesResult, Error>;
    async fn get_average_duration(&self, tr: TimeRange, fingerprint: Option<&str>) -> Result<AverageDurationResult, Error>;
    async fn get_query_rate(
        &self,
        tr: TimeRange,
        metric_name: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Result<QueryRateResult, Error>;
    async fn get_query_status_distribution(
        &self,
        tr: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<StatusDistributionPoint>, Error>;
    async fn get_query_latency_trends(&self, tr: TimeRange, fingerprint: Option<&str>) -> Result<Vec<LatencyTrendPoint>, Error>;
    async fn get_query_throughput_analysis(&self, tr: TimeRange) -> Result<Vec<ThroughputPoint>, Error>;
    async fn get_query_error_analysis(&self, tr: TimeRange, fingerprint: Option<&str>) -> Result<Vec<ErrorAnalysisPoint>, Error>;
    async fn get_query_time_range_distribution(&self, tr: TimeRange) -> Result<Vec<TimeRangeDistributionBucket>, Error>;

    async fn get_query_expressions(&self, params: QueryExpressionsParams) -> Result<Vec<QueryExpressionRow>, Error>;
    async fn get_query_executions(&self, params: QueryExecutionsParams) -> Result<Vec<QueryExecutionRow>, Error>;
    async fn get_queries_by_serie_name(&self, params: SeriesBySerieNameParams) -> Result<Vec<SerieQueryRow>, Error>;

    async fn get_rules_usage(&self, params: RulesUsageParams) -> Result<Vec<RulesUsageRow>, Error>;
    async fn get_dashboard_usage(&self, params: DashboardUsageParams) -> Result<Vec<DashboardUsageRow>, Error>;

    async fn get_series_metadata(&self, params: SeriesMetadataParams) -> Result<Vec<SeriesMetadataRow>, Error>;
    async fn get_series_metadata_by_names(&self, names: &[String], job: Option<&str>) -> Result<Vec<SeriesMetadataRow>, Error>;

    async fn get_metric_statistics(&self, tr: TimeRange, name: &str) -> Result<MetricStatistics, Error>;
    async fn get_metric_query_performance_statistics(
        &self,
        tr: TimeRange,
        name: &str,
    ) -> Result<MetricQueryPerformance, Error>;

    /// Distinct `job` labels observed in `metrics_job_index`, used by the
    /// OTLP filter's per-job allow/deny-list evaluation (C5).
    async fn list_jobs(&self) -> Result<Vec<String>, Error>;
}
