//! Domain types shared by every [`super::Provider`] implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::timerange::{Pagination, SortSpec, TimeRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Instant,
    Range,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Range => "range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Alert,
    Record,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Record => "record",
        }
    }
}

/// A fully enriched row ready for `Insert` — the output of C3's per-item
/// enrichment step (fingerprint + label matchers already computed).
#[derive(Debug, Clone)]
pub struct NewQuery {
    pub ts: DateTime<Utc>,
    pub query_param: String,
    pub time_param: Option<String>,
    pub duration_ms: i64,
    pub status_code: i32,
    pub body_size: i64,
    pub fingerprint: String,
    pub label_matchers: Option<Json>,
    pub query_type: QueryType,
    pub step: Option<f64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub total_queryable_samples: i64,
    pub peak_samples: i64,
}

#[derive(Debug, Clone)]
pub struct RulesUsageItem {
    pub serie: String,
    pub group_name: String,
    pub name: String,
    pub expression: String,
    pub kind: RuleKind,
    pub labels: Vec<String>,
}

impl RulesUsageItem {
    /// The 6-tuple identity key used for upsert and dedup.
    pub fn identity_key(&self) -> (String, &'static str, String, String, String, String) {
        let mut sorted_labels = self.labels.clone();
        sorted_labels.sort();
        (
            self.serie.clone(),
            self.kind.as_str(),
            self.group_name.clone(),
            self.name.clone(),
            self.expression.clone(),
            sorted_labels.join(","),
        )
    }
}

#[derive(Debug, Clone)]
pub struct DashboardUsageItem {
    pub id: String,
    pub serie: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub name: String,
    pub metric_type: String,
    pub help: String,
    pub unit: String,
}

#[derive(Debug, Clone)]
pub struct JobIndexItem {
    pub name: String,
    pub job: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueryTypesResult {
    pub total: i64,
    pub instant_count: i64,
    pub instant_percent: f64,
    pub range_count: i64,
    pub range_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AverageDurationResult {
    pub avg_duration_ms: f64,
    pub delta_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueryRateResult {
    pub success_total: i64,
    pub error_total: i64,
    pub success_rate_percent: f64,
    pub error_rate_percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusDistributionPoint {
    pub ts: DateTime<Utc>,
    pub success_count: i64,
    pub error_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencyTrendPoint {
    pub ts: DateTime<Utc>,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThroughputPoint {
    pub ts: DateTime<Utc>,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ErrorAnalysisPoint {
    pub ts: DateTime<Utc>,
    pub error_count: i64,
    pub error_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeRangeDistributionBucket {
    pub label: &'static str,
    pub count: i64,
    pub percent: f64,
}

pub const TIME_RANGE_BUCKET_LABELS: [&str; 6] = ["<24h", "24h", "7d", "30d", "60d", "90d+"];

#[derive(Debug, Clone, Serialize)]
pub struct QueryExpressionRow {
    pub fingerprint: String,
    pub executions: i64,
    pub avg_duration_ms: f64,
    pub error_percent: f64,
    pub peak_samples: i64,
    pub query_param: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryExecutionRow {
    pub ts: DateTime<Utc>,
    pub query_param: String,
    pub query_type: QueryType,
    pub status_code: i32,
    pub duration_ms: i64,
    pub peak_samples: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SerieQueryRow {
    pub query_param: String,
    pub avg_duration_ms: f64,
    pub avg_peak_samples: f64,
    pub max_peak_samples: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RulesUsageRow {
    pub serie: String,
    pub group_name: String,
    pub name: String,
    pub expression: String,
    pub kind: RuleKind,
    pub labels: Vec<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardUsageRow {
    pub id: String,
    pub serie: String,
    pub name: String,
    pub url: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesMetadataRow {
    pub name: String,
    pub metric_type: String,
    pub help: String,
    pub unit: String,
    pub alert_count: i64,
    pub record_count: i64,
    pub dashboard_count: i64,
    pub query_count: i64,
    pub last_queried_at: Option<DateTime<Utc>>,
}

impl SeriesMetadataRow {
    /// `Used` iff any usage count is positive; callers degrade to `Unknown`
    /// when no catalog row exists at all.
    pub fn is_used(&self) -> bool {
        self.alert_count > 0 || self.record_count > 0 || self.dashboard_count > 0 || self.query_count > 0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricStatistics {
    pub alert_count: i64,
    pub record_count: i64,
    pub dashboard_count: i64,
    pub total_alert_count: i64,
    pub total_record_count: i64,
    pub total_dashboard_count: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricQueryPerformance {
    pub total_queries: i64,
    pub avg_samples: f64,
    pub peak_samples: i64,
    pub avg_duration_ms: f64,
    pub rate: QueryRateResult,
}

#[derive(Debug, Clone)]
pub struct QueryExpressionsParams {
    pub tr: TimeRange,
    pub pagination: Pagination,
    pub sort: SortSpec,
}

#[derive(Debug, Clone)]
pub struct QueryExecutionsParams {
    pub tr: TimeRange,
    pub fingerprint: String,
    pub query_type: Option<QueryType>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone)]
pub struct SeriesBySerieNameParams {
    pub tr: TimeRange,
    pub metric_name: String,
    pub pagination: Pagination,
    pub sort: SortSpec,
}

#[derive(Debug, Clone)]
pub struct RulesUsageParams {
    pub tr: TimeRange,
    pub filter: Option<String>,
    pub pagination: Pagination,
    pub sort: SortSpec,
}

#[derive(Debug, Clone)]
pub struct DashboardUsageParams {
    pub tr: TimeRange,
    pub filter: Option<String>,
    pub pagination: Pagination,
    pub sort: SortSpec,
}

#[derive(Debug, Clone, Default)]
pub struct SeriesMetadataParams {
    pub metric_type: Option<String>,
    pub job: Option<String>,
    pub unused_only: bool,
    pub filter: Option<String>,
    pub pagination: Pagination,
}

pub const RULES_USAGE_SORT_FIELDS: [&str; 4] = ["serie", "name", "first_seen_at", "last_seen_at"];
pub const DASHBOARD_USAGE_SORT_FIELDS: [&str; 4] = ["serie", "name", "first_seen_at", "last_seen_at"];
pub const SERIE_QUERY_SORT_FIELDS: [&str; 4] = ["query_param", "avg_duration", "avg_peak_samples", "max_peak_samples"];
pub const QUERY_EXPRESSION_SORT_FIELDS: [&str; 4] = ["executions", "avg_duration", "error_percent", "peak_samples"];
