//! SQLite [`super::Provider`] implementation. Intended for single-node or
//! development deployments; uses a recursive CTE for bucket generation since
//! SQLite has no `generate_series` table-valued function in the default build.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::timerange::TimeRange;

use super::error::Error;
use super::types::*;
use super::Provider;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("src/storage/migrations/sqlite");

pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    pub async fn connect(path: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|err| Error::ConnectionFailure {
                db_type: "sqlite",
                details: err.to_string(),
            })?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|err| Error::ConnectionFailure {
                db_type: "sqlite",
                details: err.to_string(),
            })?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Provider for SqliteProvider {
    async fn migrate(&self) -> Result<(), Error> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|cause| Error::SchemaFailure { db_type: "sqlite", cause })
    }

    async fn ping(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| Error::query("ping", e))?;
        Ok(())
    }

    async fn insert_queries(&self, items: &[NewQuery]) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| Error::query("insert_queries.begin", e))?;
        for item in items {
            sqlx::query(
                "INSERT INTO queries (ts, query_param, time_param, duration_ms, status_code, body_size, \
                 fingerprint, label_matchers, query_type, step, start_param, end_param, \
                 total_queryable_samples, peak_samples) \
                 VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
            )
            .bind(item.ts)
            .bind(&item.query_param)
            .bind(&item.time_param)
            .bind(item.duration_ms)
            .bind(item.status_code)
            .bind(item.body_size)
            .bind(&item.fingerprint)
            .bind(&item.label_matchers)
            .bind(item.query_type.as_str())
            .bind(item.step)
            .bind(item.start)
            .bind(item.end)
            .bind(item.total_queryable_samples)
            .bind(item.peak_samples)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::query("insert_queries", e))?;
        }
        tx.commit().await.map_err(|e| Error::query("insert_queries.commit", e))?;
        Ok(())
    }

    async fn insert_rules_usage(&self, items: &[RulesUsageItem]) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| Error::query("insert_rules_usage.begin", e))?;
        let now = Utc::now();
        for item in items {
            let mut labels = item.labels.clone();
            labels.sort();
            sqlx::query(
                "INSERT INTO rules_usage (serie, kind, group_name, name, expression, labels, first_seen_at, last_seen_at) \
                 VALUES (?,?,?,?,?,?,?,?) \
                 ON CONFLICT (serie, kind, group_name, name, expression, labels) \
                 DO UPDATE SET last_seen_at = excluded.last_seen_at",
            )
            .bind(&item.serie)
            .bind(item.kind.as_str())
            .bind(&item.group_name)
            .bind(&item.name)
            .bind(&item.expression)
            .bind(labels.join(","))
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::query("insert_rules_usage", e))?;
        }
        tx.commit().await.map_err(|e| Error::query("insert_rules_usage.commit", e))?;
        Ok(())
    }

    async fn insert_dashboard_usage(&self, items: &[DashboardUsageItem]) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| Error::query("insert_dashboard_usage.begin", e))?;
        let now = Utc::now();
        for item in items {
            sqlx::query(
                "INSERT INTO dashboard_usage (dashboard_id, serie, name, url, first_seen_at, last_seen_at) \
                 VALUES (?,?,?,?,?,?) \
                 ON CONFLICT (dashboard_id, serie) \
                 DO UPDATE SET last_seen_at = excluded.last_seen_at, name = excluded.name, url = excluded.url",
            )
            .bind(&item.id)
            .bind(&item.serie)
            .bind(&item.name)
            .bind(&item.url)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::query("insert_dashboard_usage", e))?;
        }
        tx.commit().await.map_err(|e| Error::query("insert_dashboard_usage.commit", e))?;
        Ok(())
    }

    async fn upsert_metrics_catalog(&self, items: &[CatalogItem]) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| Error::query("upsert_metrics_catalog.begin", e))?;
        let now = Utc::now();
        for item in items {
            sqlx::query(
                "INSERT INTO metrics_catalog (name, metric_type, help, unit, updated_at) VALUES (?,?,?,?,?) \
                 ON CONFLICT (name) DO UPDATE SET metric_type = excluded.metric_type, help = excluded.help, \
                 unit = excluded.unit, updated_at = excluded.updated_at",
            )
            .bind(&item.name)
            .bind(&item.metric_type)
            .bind(&item.help)
            .bind(&item.unit)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::query("upsert_metrics_catalog", e))?;
        }
        tx.commit().await.map_err(|e| Error::query("upsert_metrics_catalog.commit", e))?;
        Ok(())
    }

    async fn upsert_metrics_job_index(&self, items: &[JobIndexItem]) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| Error::query("upsert_metrics_job_index.begin", e))?;
        let now = Utc::now();
        for item in items {
            sqlx::query(
                "INSERT INTO metrics_job_index (name, job, updated_at) VALUES (?,?,?) \
                 ON CONFLICT (name, job) DO UPDATE SET updated_at = excluded.updated_at",
            )
            .bind(&item.name)
            .bind(&item.job)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::query("upsert_metrics_job_index", e))?;
        }
        tx.commit().await.map_err(|e| Error::query("upsert_metrics_job_index.commit", e))?;
        Ok(())
    }

    async fn refresh_metrics_usage_summary(&self, tr: TimeRange) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO metrics_usage_summary (name, alert_count, record_count, dashboard_count, query_count, last_queried_at, refreshed_at) \
             SELECT \
                 catalog.name, \
                 COALESCE(r.alert_count, 0), \
                 COALESCE(r.record_count, 0), \
                 COALESCE(d.dashboard_count, 0), \
                 COALESCE(q.query_count, 0), \
                 q.last_queried_at, \
                 ? \
             FROM metrics_catalog catalog \
             LEFT JOIN ( \
                 SELECT serie, \
                     COUNT(*) FILTER (WHERE kind = 'alert') AS alert_count, \
                     COUNT(*) FILTER (WHERE kind = 'record') AS record_count \
                 FROM rules_usage WHERE first_seen_at <= ? AND last_seen_at >= ? GROUP BY serie \
             ) r ON r.serie = catalog.name \
             LEFT JOIN ( \
                 SELECT serie, COUNT(DISTINCT dashboard_id) AS dashboard_count FROM dashboard_usage \
                 WHERE first_seen_at <= ? AND last_seen_at >= ? GROUP BY serie \
             ) d ON d.serie = catalog.name \
             LEFT JOIN ( \
                 SELECT json_extract(label_matchers, '$[0].__name__') AS name, COUNT(*) AS query_count, MAX(ts) AS last_queried_at \
                 FROM queries \
                 WHERE ts BETWEEN ? AND ? AND label_matchers IS NOT NULL \
                 GROUP BY json_extract(label_matchers, '$[0].__name__') \
             ) q ON q.name = catalog.name \
             ON CONFLICT (name) DO UPDATE SET \
                 alert_count = excluded.alert_count, \
                 record_count = excluded.record_count, \
                 dashboard_count = excluded.dashboard_count, \
                 query_count = excluded.query_count, \
                 last_queried_at = excluded.last_queried_at, \
                 refreshed_at = excluded.refreshed_at",
        )
        .bind(Utc::now())
        .bind(tr.to)
        .bind(tr.from)
        .bind(tr.to)
        .bind(tr.from)
        .bind(tr.from)
        .bind(tr.to)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::query("refresh_metrics_usage_summary", e))?;
        Ok(())
    }

    async fn delete_queries_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM queries WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::query("delete_queries_before", e))?;
        Ok(result.rows_affected())
    }

    async fn get_query_types(&self, tr: TimeRange, fingerprint: Option<&str>) -> Result<QueryTypesResult, Error> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE query_type = 'instant') AS instant_count, \
                COUNT(*) FILTER (WHERE query_type = 'range') AS range_count \
             FROM queries WHERE ts BETWEEN ? AND ? AND (?3 IS NULL OR fingerprint = ?3)",
        )
        .bind(tr.from)
        .bind(tr.to)
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::query("get_query_types", e))?;
        let total: i64 = row.try_get("total").map_err(|e| Error::query("get_query_types", e))?;
        let instant_count: i64 = row.try_get("instant_count").map_err(|e| Error::query("get_query_types", e))?;
        let range_count: i64 = row.try_get("range_count").map_err(|e| Error::query("get_query_types", e))?;
        Ok(QueryTypesResult {
            total,
            instant_count,
            instant_percent: percent(instant_count, total),
            range_count,
            range_percent: percent(range_count, total),
        })
    }

    async fn get_average_duration(&self, tr: TimeRange, fingerprint: Option<&str>) -> Result<AverageDurationResult, Error> {
        let current = avg_duration(&self.pool, tr, fingerprint).await?;
        let previous = avg_duration(&self.pool, tr.previous(), fingerprint).await?;
        Ok(AverageDurationResult {
            avg_duration_ms: current,
            delta_percent: delta_percent(current, previous),
        })
    }

    async fn get_query_rate(
        &self,
        tr: TimeRange,
        metric_name: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Result<QueryRateResult, Error> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE status_code < 400) AS success_total, \
                COUNT(*) FILTER (WHERE status_code >= 400) AS error_total \
             FROM queries \
             WHERE ts BETWEEN ?1 AND ?2 \
               AND (?3 IS NULL OR fingerprint = ?3) \
               AND (?4 IS NULL OR json_extract(label_matchers, '$[0].__name__') = ?4)",
        )
        .bind(tr.from)
        .bind(tr.to)
        .bind(fingerprint)
        .bind(metric_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::query("get_query_rate", e))?;
        let success_total: i64 = row.try_get("success_total").map_err(|e| Error::query("get_query_rate", e))?;
        let error_total: i64 = row.try_get("error_total").map_err(|e| Error::query("get_query_rate", e))?;
        let total = success_total + error_total;
        Ok(QueryRateResult {
            success_total,
            error_total,
            success_rate_percent: percent(success_total, total),
            error_rate_percent: percent(error_total, total),
        })
    }

    async fn get_query_status_distribution(
        &self,
        tr: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<StatusDistributionPoint>, Error> {
        let granularity = crate::timerange::BucketGranularity::for_range(tr.from, tr.to);
        let rows = sqlx::query(&bucket_cte_with_fingerprint(
            "COALESCE(COUNT(*) FILTER (WHERE q.status_code < 400), 0) AS success_count, \
             COALESCE(COUNT(*) FILTER (WHERE q.status_code >= 400), 0) AS error_count",
        ))
        .bind(tr.from)
        .bind(tr.to)
        .bind(granularity.sqlite_modifier())
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::query("get_query_status_distribution", e))?;
        rows.into_iter()
            .map(|row| {
                Ok(StatusDistributionPoint {
                    ts: row.try_get("ts").map_err(|e| Error::query("get_query_status_distribution", e))?,
                    success_count: row.try_get("success_count").map_err(|e| Error::query("get_query_status_distribution", e))?,
                    error_count: row.try_get("error_count").map_err(|e| Error::query("get_query_status_distribution", e))?,
                })
            })
            .collect()
    }

    async fn get_query_latency_trends(&self, tr: TimeRange, fingerprint: Option<&str>) -> Result<Vec<LatencyTrendPoint>, Error> {
        let granularity = crate::timerange::BucketGranularity::for_range(tr.from, tr.to);
        let rows = sqlx::query(&bucket_cte_with_fingerprint(
            "COALESCE(AVG(q.duration_ms), 0) AS avg_duration_ms, COALESCE(AVG(q.duration_ms), 0) AS p95_duration_ms",
        ))
        .bind(tr.from)
        .bind(tr.to)
        .bind(granularity.sqlite_modifier())
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::query("get_query_latency_trends", e))?;
        rows.into_iter()
            .map(|row| {
                Ok(LatencyTrendPoint {
                    ts: row.try_get("ts").map_err(|e| Error::query("get_query_latency_trends", e))?,
                    avg_duration_ms: row.try_get("avg_duration_ms").map_err(|e| Error::query("get_query_latency_trends", e))?,
                    p95_duration_ms: row.try_get("p95_duration_ms").map_err(|e| Error::query("get_query_latency_trends", e))?,
                })
            })
            .collect()
    }

    async fn get_query_throughput_analysis(&self, tr: TimeRange) -> Result<Vec<ThroughputPoint>, Error> {
        let granularity = crate::timerange::BucketGranularity::for_range(tr.from, tr.to);
        let rows = sqlx::query(&bucket_cte("COALESCE(COUNT(q.id), 0) AS count"))
            .bind(tr.from)
            .bind(tr.to)
            .bind(granularity.sqlite_modifier())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::query("get_query_throughput_analysis", e))?;
        rows.into_iter()
            .map(|row| {
                Ok(ThroughputPoint {
                    ts: row.try_get("ts").map_err(|e| Error::query("get_query_throughput_analysis", e))?,
                    count: row.try_get("count").map_err(|e| Error::query("get_query_throughput_analysis", e))?,
                })
            })
            .collect()
    }

    async fn get_query_error_analysis(&self, tr: TimeRange, fingerprint: Option<&str>) -> Result<Vec<ErrorAnalysisPoint>, Error> {
        let granularity = crate::timerange::BucketGranularity::for_range(tr.from, tr.to);
        let rows = sqlx::query(&bucket_cte_with_fingerprint(
            "COALESCE(COUNT(*) FILTER (WHERE q.status_code >= 400), 0) AS error_count, COALESCE(COUNT(q.id), 0) AS total_count",
        ))
        .bind(tr.from)
        .bind(tr.to)
        .bind(granularity.sqlite_modifier())
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::query("get_query_error_analysis", e))?;
        rows.into_iter()
            .map(|row| {
                let error_count: i64 = row.try_get("error_count").map_err(|e| Error::query("get_query_error_analysis", e))?;
                let total_count: i64 = row.try_get("total_count").map_err(|e| Error::query("get_query_error_analysis", e))?;
                Ok(ErrorAnalysisPoint {
                    ts: row.try_get("ts").map_err(|e| Error::query("get_query_error_analysis", e))?,
                    error_count,
                    error_percent: percent(error_count, total_count),
                })
            })
            .collect()
    }

    async fn get_query_time_range_distribution(&self, tr: TimeRange) -> Result<Vec<TimeRangeDistributionBucket>, Error> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE julianday(end_param) - julianday(start_param) < 1.0) AS b_lt24h, \
                COUNT(*) FILTER (WHERE julianday(end_param) - julianday(start_param) >= 1.0 AND julianday(end_param) - julianday(start_param) < 7.0) AS b_24h, \
                COUNT(*) FILTER (WHERE julianday(end_param) - julianday(start_param) >= 7.0 AND julianday(end_param) - julianday(start_param) < 30.0) AS b_7d, \
                COUNT(*) FILTER (WHERE julianday(end_param) - julianday(start_param) >= 30.0 AND julianday(end_param) - julianday(start_param) < 60.0) AS b_30d, \
                COUNT(*) FILTER (WHERE julianday(end_param) - julianday(start_param) >= 60.0 AND julianday(end_param) - julianday(start_param) < 90.0) AS b_60d, \
                COUNT(*) FILTER (WHERE julianday(end_param) - julianday(start_param) >= 90.0) AS b_90d \
             FROM queries \
             WHERE ts BETWEEN ? AND ? AND query_type = 'range' AND start_param IS NOT NULL AND end_param IS NOT NULL",
        )
        .bind(tr.from)
        .bind(tr.to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::query("get_query_time_range_distribution", e))?;
        let counts: Vec<i64> = ["b_lt24h", "b_24h", "b_7d", "b_30d", "b_60d", "b_90d"]
            .iter()
            .map(|col| row.try_get::<i64, _>(*col))
            .collect::<Result<_, _>>()
            .map_err(|e| Error::query("get_query_time_range_distribution", e))?;
        let total: i64 = counts.iter().sum();
        Ok(TIME_RANGE_BUCKET_LABELS
            .iter()
            .zip(counts)
            .map(|(label, count)| TimeRangeDistributionBucket {
                label,
                count,
                percent: percent(count, total),
            })
            .collect())
    }

    async fn get_query_expressions(&self, params: QueryExpressionsParams) -> Result<Vec<QueryExpressionRow>, Error> {
        let sql = format!(
            "SELECT fingerprint, COUNT(*) AS executions, AVG(duration_ms) AS avg_duration_ms, \
                100.0 * COUNT(*) FILTER (WHERE status_code >= 400) / NULLIF(COUNT(*), 0) AS error_percent, \
                MAX(peak_samples) AS peak_samples, \
                (SELECT query_param FROM queries q2 WHERE q2.fingerprint = queries.fingerprint ORDER BY ts DESC LIMIT 1) AS query_param \
             FROM queries WHERE ts BETWEEN ? AND ? \
             GROUP BY fingerprint ORDER BY {} {} LIMIT ? OFFSET ?",
            quote_ident(&params.sort.sort_by),
            params.sort.sort_order.as_sql()
        );
        let rows = sqlx::query(&sql)
            .bind(params.tr.from)
            .bind(params.tr.to)
            .bind(i64::from(params.pagination.page_size))
            .bind(params.pagination.offset())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::query("get_query_expressions", e))?;
        rows.into_iter()
            .map(|row| {
                Ok(QueryExpressionRow {
                    fingerprint: row.try_get("fingerprint").map_err(|e| Error::query("get_query_expressions", e))?,
                    executions: row.try_get("executions").map_err(|e| Error::query("get_query_expressions", e))?,
                    avg_duration_ms: row.try_get::<Option<f64>, _>("avg_duration_ms").map_err(|e| Error::query("get_query_expressions", e))?.unwrap_or_default(),
                    error_percent: row.try_get::<Option<f64>, _>("error_percent").map_err(|e| Error::query("get_query_expressions", e))?.unwrap_or_default(),
                    peak_samples: row.try_get("peak_samples").map_err(|e| Error::query("get_query_expressions", e))?,
                    query_param: row.try_get("query_param").map_err(|e| Error::query("get_query_expressions", e))?,
                })
            })
            .collect()
    }

    async fn get_query_executions(&self, params: QueryExecutionsParams) -> Result<Vec<QueryExecutionRow>, Error> {
        let rows = sqlx::query(
            "SELECT ts, query_param, query_type, status_code, duration_ms, peak_samples FROM queries \
             WHERE ts BETWEEN ?1 AND ?2 AND fingerprint = ?3 AND (?4 IS NULL OR query_type = ?4) \
             ORDER BY ts DESC LIMIT ?5 OFFSET ?6",
        )
        .bind(params.tr.from)
        .bind(params.tr.to)
        .bind(&params.fingerprint)
        .bind(params.query_type.map(QueryType::as_str))
        .bind(i64::from(params.pagination.page_size))
        .bind(params.pagination.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::query("get_query_executions", e))?;
        rows.into_iter()
            .map(|row| {
                let query_type: String = row.try_get("query_type").map_err(|e| Error::query("get_query_executions", e))?;
                Ok(QueryExecutionRow {
                    ts: row.try_get("ts").map_err(|e| Error::query("get_query_executions", e))?,
                    query_param: row.try_get("query_param").map_err(|e| Error::query("get_query_executions", e))?,
                    query_type: if query_type == "instant" { QueryType::Instant } else { QueryType::Range },
                    status_code: row.try_get("status_code").map_err(|e| Error::query("get_query_executions", e))?,
                    duration_ms: row.try_get("duration_ms").map_err(|e| Error::query("get_query_executions", e))?,
                    peak_samples: row.try_get("peak_samples").map_err(|e| Error::query("get_query_executions", e))?,
                })
            })
            .collect()
    }

    async fn get_queries_by_serie_name(&self, params: SeriesBySerieNameParams) -> Result<Vec<SerieQueryRow>, Error> {
        let sql = format!(
            "SELECT query_param, AVG(duration_ms) AS avg_duration_ms, AVG(peak_samples) AS avg_peak_samples, \
                MAX(peak_samples) AS max_peak_samples \
             FROM queries \
             WHERE ts BETWEEN ? AND ? AND json_extract(label_matchers, '$[0].__name__') = ? \
             GROUP BY query_param ORDER BY {} {} LIMIT ? OFFSET ?",
            quote_ident(&params.sort.sort_by),
            params.sort.sort_order.as_sql()
        );
        let rows = sqlx::query(&sql)
            .bind(params.tr.from)
            .bind(params.tr.to)
            .bind(&params.metric_name)
            .bind(i64::from(params.pagination.page_size))
            .bind(params.pagination.offset())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::query("get_queries_by_serie_name", e))?;
        rows.into_iter()
            .map(|row| {
                Ok(SerieQueryRow {
                    query_param: row.try_get("query_param").map_err(|e| Error::query("get_queries_by_serie_name", e))?,
                    avg_duration_ms: row.try_get("avg_duration_ms").map_err(|e| Error::query("get_queries_by_serie_name", e))?,
                    avg_peak_samples: row.try_get("avg_peak_samples").map_err(|e| Error::query("get_queries_by_serie_name", e))?,
                    max_peak_samples: row.try_get("max_peak_samples").map_err(|e| Error::query("get_queries_by_serie_name", e))?,
                })
            })
            .collect()
    }

    async fn get_rules_usage(&self, params: RulesUsageParams) -> Result<Vec<RulesUsageRow>, Error> {
        let sql = format!(
            "SELECT serie, group_name, name, expression, kind, labels, first_seen_at, last_seen_at FROM ( \
                SELECT serie, group_name, name, expression, kind, labels, first_seen_at, last_seen_at, \
                    ROW_NUMBER() OVER (PARTITION BY serie, kind, group_name, name ORDER BY last_seen_at DESC) AS rn \
                FROM rules_usage \
                WHERE first_seen_at <= ?2 AND last_seen_at >= ?1 \
             ) ranked \
             WHERE rn = 1 AND (?3 IS NULL OR name LIKE '%' || ?3 || '%' OR expression LIKE '%' || ?3 || '%') \
             ORDER BY {} {} LIMIT ?4 OFFSET ?5",
            quote_ident(&params.sort.sort_by),
            params.sort.sort_order.as_sql()
        );
        let rows = sqlx::query(&sql)
            .bind(params.tr.from)
            .bind(params.tr.to)
            .bind(&params.filter)
            .bind(i64::from(params.pagination.page_size))
            .bind(params.pagination.offset())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::query("get_rules_usage", e))?;
        rows.into_iter().map(row_to_rules_usage).collect()
    }

    async fn get_dashboard_usage(&self, params: DashboardUsageParams) -> Result<Vec<DashboardUsageRow>, Error> {
        let sql = format!(
            "SELECT dashboard_id, serie, name, url, first_seen_at, last_seen_at FROM ( \
                SELECT dashboard_id, serie, name, url, first_seen_at, last_seen_at, \
                    ROW_NUMBER() OVER (PARTITION BY dashboard_id, serie ORDER BY last_seen_at DESC) AS rn \
                FROM dashboard_usage \
                WHERE first_seen_at <= ?2 AND last_seen_at >= ?1 \
             ) ranked \
             WHERE rn = 1 AND (?3 IS NULL OR name LIKE '%' || ?3 || '%' OR url LIKE '%' || ?3 || '%') \
             ORDER BY {} {} LIMIT ?4 OFFSET ?5",
            quote_ident(&params.sort.sort_by),
            params.sort.sort_order.as_sql()
        );
        let rows = sqlx::query(&sql)
            .bind(params.tr.from)
            .bind(params.tr.to)
            .bind(&params.filter)
            .bind(i64::from(params.pagination.page_size))
            .bind(params.pagination.offset())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::query("get_dashboard_usage", e))?;
        rows.into_iter().map(row_to_dashboard_usage).collect()
    }

    async fn get_series_metadata(&self, params: SeriesMetadataParams) -> Result<Vec<SeriesMetadataRow>, Error> {
        let rows = sqlx::query(
            "SELECT c.name, c.metric_type, c.help, c.unit, \
                COALESCE(s.alert_count, 0) AS alert_count, COALESCE(s.record_count, 0) AS record_count, \
                COALESCE(s.dashboard_count, 0) AS dashboard_count, COALESCE(s.query_count, 0) AS query_count, \
                s.last_queried_at \
             FROM metrics_catalog c \
             LEFT JOIN metrics_usage_summary s ON s.name = c.name \
             LEFT JOIN metrics_job_index j ON j.name = c.name \
             WHERE (?1 IS NULL OR c.metric_type = ?1) \
               AND (?2 IS NULL OR j.job = ?2) \
               AND (?3 IS NULL OR c.name LIKE '%' || ?3 || '%') \
               AND (?4 = 0 OR COALESCE(s.alert_count, 0) + COALESCE(s.record_count, 0) + \
                    COALESCE(s.dashboard_count, 0) + COALESCE(s.query_count, 0) = 0) \
             GROUP BY c.name ORDER BY c.name LIMIT ?5 OFFSET ?6",
        )
        .bind(&params.metric_type)
        .bind(&params.job)
        .bind(&params.filter)
        .bind(params.unused_only)
        .bind(i64::from(params.pagination.page_size))
        .bind(params.pagination.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::query("get_series_metadata", e))?;
        rows.into_iter().map(row_to_series_metadata).collect()
    }

    async fn get_series_metadata_by_names(&self, names: &[String], job: Option<&str>) -> Result<Vec<SeriesMetadataRow>, Error> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = names.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT c.name, c.metric_type, c.help, c.unit, \
                COALESCE(s.alert_count, 0) AS alert_count, COALESCE(s.record_count, 0) AS record_count, \
                COALESCE(s.dashboard_count, 0) AS dashboard_count, COALESCE(s.query_count, 0) AS query_count, \
                s.last_queried_at \
             FROM metrics_catalog c \
             LEFT JOIN metrics_usage_summary s ON s.name = c.name \
             LEFT JOIN metrics_job_index j ON j.name = c.name \
             WHERE c.name IN ({placeholders}) AND (? IS NULL OR j.job = ?) \
             GROUP BY c.name, c.metric_type, c.help, c.unit, s.alert_count, s.record_count, s.dashboard_count, s.query_count, s.last_queried_at"
        );
        let mut query = sqlx::query(&sql);
        for name in names {
            query = query.bind(name);
        }
        query = query.bind(job).bind(job);
        let rows = query.fetch_all(&self.pool).await.map_err(|e| Error::query("get_series_metadata_by_names", e))?;
        rows.into_iter().map(row_to_series_metadata).collect()
    }

    async fn get_metric_statistics(&self, tr: TimeRange, name: &str) -> Result<MetricStatistics, Error> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE kind = 'alert' AND last_seen_at BETWEEN ?2 AND ?3) AS alert_count, \
                COUNT(*) FILTER (WHERE kind = 'record' AND last_seen_at BETWEEN ?2 AND ?3) AS record_count, \
                COUNT(*) FILTER (WHERE kind = 'alert') AS total_alert_count, \
                COUNT(*) FILTER (WHERE kind = 'record') AS total_record_count \
             FROM rules_usage WHERE serie = ?1",
        )
        .bind(name)
        .bind(tr.from)
        .bind(tr.to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::query("get_metric_statistics.rules", e))?;
        let dash_row = sqlx::query(
            "SELECT COUNT(*) FILTER (WHERE last_seen_at BETWEEN ?2 AND ?3) AS dashboard_count, COUNT(*) AS total_dashboard_count \
             FROM dashboard_usage WHERE serie = ?1",
        )
        .bind(name)
        .bind(tr.from)
        .bind(tr.to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::query("get_metric_statistics.dashboards", e))?;
        Ok(MetricStatistics {
            alert_count: row.try_get("alert_count").map_err(|e| Error::query("get_metric_statistics", e))?,
            record_count: row.try_get("record_count").map_err(|e| Error::query("get_metric_statistics", e))?,
            dashboard_count: dash_row.try_get("dashboard_count").map_err(|e| Error::query("get_metric_statistics", e))?,
            total_alert_count: row.try_get("total_alert_count").map_err(|e| Error::query("get_metric_statistics", e))?,
            total_record_count: row.try_get("total_record_count").map_err(|e| Error::query("get_metric_statistics", e))?,
            total_dashboard_count: dash_row.try_get("total_dashboard_count").map_err(|e| Error::query("get_metric_statistics", e))?,
        })
    }

    async fn get_metric_query_performance_statistics(
        &self,
        tr: TimeRange,
        name: &str,
    ) -> Result<MetricQueryPerformance, Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total_queries, COALESCE(AVG(total_queryable_samples), 0) AS avg_samples, \
                COALESCE(MAX(peak_samples), 0) AS peak_samples, COALESCE(AVG(duration_ms), 0) AS avg_duration_ms, \
                COUNT(*) FILTER (WHERE status_code < 400) AS success_total, \
                COUNT(*) FILTER (WHERE status_code >= 400) AS error_total \
             FROM queries \
             WHERE ts BETWEEN ? AND ? AND json_extract(label_matchers, '$[0].__name__') = ?",
        )
        .bind(tr.from)
        .bind(tr.to)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::query("get_metric_query_performance_statistics", e))?;
        let success_total: i64 = row.try_get("success_total").map_err(|e| Error::query("get_metric_query_performance_statistics", e))?;
        let error_total: i64 = row.try_get("error_total").map_err(|e| Error::query("get_metric_query_performance_statistics", e))?;
        let total = success_total + error_total;
        Ok(MetricQueryPerformance {
            total_queries: row.try_get("total_queries").map_err(|e| Error::query("get_metric_query_performance_statistics", e))?,
            avg_samples: row.try_get("avg_samples").map_err(|e| Error::query("get_metric_query_performance_statistics", e))?,
            peak_samples: row.try_get("peak_samples").map_err(|e| Error::query("get_metric_query_performance_statistics", e))?,
            avg_duration_ms: row.try_get("avg_duration_ms").map_err(|e| Error::query("get_metric_query_performance_statistics", e))?,
            rate: QueryRateResult {
                success_total,
                error_total,
                success_rate_percent: percent(success_total, total),
                error_rate_percent: percent(error_total, total),
            },
        })
    }

    async fn list_jobs(&self) -> Result<Vec<String>, Error> {
        let rows = sqlx::query("SELECT DISTINCT job FROM metrics_job_index ORDER BY job")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::query("list_jobs", e))?;
        rows.into_iter()
            .map(|row| row.try_get("job").map_err(|e| Error::query("list_jobs", e)))
            .collect()
    }
}

async fn avg_duration(pool: &SqlitePool, tr: TimeRange, fingerprint: Option<&str>) -> Result<f64, Error> {
    let row = sqlx::query(
        "SELECT COALESCE(AVG(duration_ms), 0) AS avg_duration_ms FROM queries \
         WHERE ts BETWEEN ?1 AND ?2 AND (?3 IS NULL OR fingerprint = ?3)",
    )
    .bind(tr.from)
    .bind(tr.to)
    .bind(fingerprint)
    .fetch_one(pool)
    .await
    .map_err(|e| Error::query("get_average_duration", e))?;
    row.try_get("avg_duration_ms").map_err(|e| Error::query("get_average_duration", e))
}

fn percent(part: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

fn delta_percent(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        0.0
    } else {
        100.0 * (current - previous) / previous
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', ""))
}

/// Builds a recursive-CTE bucket skeleton query. `?1`/`?2` bind the range,
/// `?3` binds the `datetime()` step modifier (e.g. `'+15 minutes'`).
fn bucket_cte(select_exprs: &str) -> String {
    format!(
        "WITH RECURSIVE buckets(bucket_ts) AS ( \
            SELECT ?1 \
            UNION ALL \
            SELECT datetime(bucket_ts, ?3) FROM buckets WHERE bucket_ts < ?2 \
         ) \
         SELECT buckets.bucket_ts AS ts, {select_exprs} \
         FROM buckets \
         LEFT JOIN queries q ON q.ts >= buckets.bucket_ts AND q.ts < datetime(buckets.bucket_ts, ?3) \
         GROUP BY buckets.bucket_ts ORDER BY buckets.bucket_ts"
    )
}

/// Same as [`bucket_cte`] but also filters the joined `queries` rows by an
/// optional fingerprint, bound as `?4`.
fn bucket_cte_with_fingerprint(select_exprs: &str) -> String {
    format!(
        "WITH RECURSIVE buckets(bucket_ts) AS ( \
            SELECT ?1 \
            UNION ALL \
            SELECT datetime(bucket_ts, ?3) FROM buckets WHERE bucket_ts < ?2 \
         ) \
         SELECT buckets.bucket_ts AS ts, {select_exprs} \
         FROM buckets \
         LEFT JOIN queries q ON q.ts >= buckets.bucket_ts AND q.ts < datetime(buckets.bucket_ts, ?3) \
            AND (?4 IS NULL OR q.fingerprint = ?4) \
         GROUP BY buckets.bucket_ts ORDER BY buckets.bucket_ts"
    )
}

fn row_to_rules_usage(row: sqlx::sqlite::SqliteRow) -> Result<RulesUsageRow, Error> {
    let kind: String = row.try_get("kind").map_err(|e| Error::query("get_rules_usage", e))?;
    let labels: String = row.try_get("labels").map_err(|e| Error::query("get_rules_usage", e))?;
    Ok(RulesUsageRow {
        serie: row.try_get("serie").map_err(|e| Error::query("get_rules_usage", e))?,
        group_name: row.try_get("group_name").map_err(|e| Error::query("get_rules_usage", e))?,
        name: row.try_get("name").map_err(|e| Error::query("get_rules_usage", e))?,
        expression: row.try_get("expression").map_err(|e| Error::query("get_rules_usage", e))?,
        kind: if kind == "alert" { RuleKind::Alert } else { RuleKind::Record },
        labels: labels.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect(),
        first_seen_at: row.try_get("first_seen_at").map_err(|e| Error::query("get_rules_usage", e))?,
        last_seen_at: row.try_get("last_seen_at").map_err(|e| Error::query("get_rules_usage", e))?,
    })
}

fn row_to_dashboard_usage(row: sqlx::sqlite::SqliteRow) -> Result<DashboardUsageRow, Error> {
    Ok(DashboardUsageRow {
        id: row.try_get("dashboard_id").map_err(|e| Error::query("get_dashboard_usage", e))?,
        serie: row.try_get("serie").map_err(|e| Error::query("get_dashboard_usage", e))?,
        name: row.try_get("name").map_err(|e| Error::query("get_dashboard_usage", e))?,
        url: row.try_get("url").map_err(|e| Error::query("get_dashboard_usage", e))?,
        first_seen_at: row.try_get("first_seen_at").map_err(|e| Error::query("get_dashboard_usage", e))?,
        last_seen_at: row.try_get("last_seen_at").map_err(|e| Error::query("get_dashboard_usage", e))?,
    })
}

fn row_to_series_metadata(row: sqlx::sqlite::SqliteRow) -> Result<SeriesMetadataRow, Error> {
    Ok(SeriesMetadataRow {
        name: row.try_get("name").map_err(|e| Error::query("get_series_metadata", e))?,
        metric_type: row.try_get("metric_type").map_err(|e| Error::query("get_series_metadata", e))?,
        help: row.try_get("help").map_err(|e| Error::query("get_series_metadata", e))?,
        unit: row.try_get("unit").map_err(|e| Error::query("get_series_metadata", e))?,
        alert_count: row.try_get("alert_count").map_err(|e| Error::query("get_series_metadata", e))?,
        record_count: row.try_get("record_count").map_err(|e| Error::query("get_series_metadata", e))?,
        dashboard_count: row.try_get("dashboard_count").map_err(|e| Error::query("get_series_metadata", e))?,
        query_count: row.try_get("query_count").map_err(|e| Error::query("get_series_metadata", e))?,
        last_queried_at: row.try_get("last_queried_at").map_err(|e| Error::query("get_series_metadata", e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timerange::{Pagination, SortOrder, SortSpec};
    use chrono::Duration;

    async fn provider() -> SqliteProvider {
        let provider = SqliteProvider::connect(":memory:").await.expect("open in-memory sqlite");
        provider.migrate().await.expect("run migrations");
        provider
    }

    fn new_query(ts: DateTime<Utc>, duration_ms: i64, status_code: i32, fingerprint: &str) -> NewQuery {
        NewQuery {
            ts,
            query_param: "up".to_owned(),
            time_param: None,
            duration_ms,
            status_code,
            body_size: 128,
            fingerprint: fingerprint.to_owned(),
            label_matchers: Some(serde_json::json!([{"__name__": "up"}])),
            query_type: QueryType::Instant,
            step: None,
            start: None,
            end: None,
            total_queryable_samples: 0,
            peak_samples: 0,
        }
    }

    /// S1: average duration delta between a window and its previous window.
    #[tokio::test]
    async fn average_duration_delta_matches_seed() {
        let provider = provider().await;
        let base = Utc::now();

        let mut rows = Vec::new();
        for i in 0..5 {
            rows.push(new_query(base - Duration::minutes(20) + Duration::minutes(i), 10, 200, "fp-old"));
        }
        for i in 0..5 {
            rows.push(new_query(base - Duration::minutes(10) + Duration::minutes(i), 20, 200, "fp-new"));
        }
        provider.insert_queries(&rows).await.expect("insert seed rows");

        let tr = TimeRange::new(base - Duration::minutes(10), base);
        let result = provider.get_average_duration(tr, None).await.expect("get_average_duration");

        assert!((result.avg_duration_ms - 20.0).abs() < 0.01);
        assert!((result.delta_percent - 100.0).abs() <= 0.5);
    }

    /// S2: success/error rate for one metric+fingerprint pair.
    #[tokio::test]
    async fn query_rate_matches_seed() {
        let provider = provider().await;
        let base = Utc::now();

        let mut rows = Vec::new();
        for _ in 0..3 {
            rows.push(new_query(base, 5, 200, "fp1"));
        }
        for _ in 0..2 {
            rows.push(new_query(base, 5, 500, "fp1"));
        }
        provider.insert_queries(&rows).await.expect("insert seed rows");

        let tr = TimeRange::new(base - Duration::minutes(5), base + Duration::minutes(5));
        let result = provider.get_query_rate(tr, Some("up"), Some("fp1")).await.expect("get_query_rate");

        assert_eq!(result.success_total, 3);
        assert_eq!(result.error_total, 2);
        assert!((result.success_rate_percent - 60.0).abs() < 0.01);
        assert!((result.error_rate_percent - 40.0).abs() < 0.01);
    }

    /// S3: distribution of query time-ranges (range length) into buckets.
    #[tokio::test]
    async fn time_range_distribution_matches_seed() {
        let provider = provider().await;
        let base = Utc::now();

        let mut rows = Vec::new();
        let mut push_range = |span: Duration, count: i64| {
            for _ in 0..count {
                let mut q = new_query(base, 5, 200, "fp-range");
                q.query_type = QueryType::Range;
                q.start = Some(base - span);
                q.end = Some(base);
                rows.push(q);
            }
        };
        push_range(Duration::minutes(5), 5);
        push_range(Duration::hours(48), 3);
        push_range(Duration::days(8), 2);
        push_range(Duration::days(31), 1);
        push_range(Duration::days(65), 1);
        push_range(Duration::days(100), 1);
        rows.push(new_query(base, 5, 200, "fp-instant"));
        provider.insert_queries(&rows).await.expect("insert seed rows");

        let tr = TimeRange::new(base - Duration::days(200), base + Duration::days(1));
        let buckets = provider.get_query_time_range_distribution(tr).await.expect("get_query_time_range_distribution");

        let by_label: std::collections::HashMap<_, _> = buckets.iter().map(|b| (b.label, b)).collect();
        assert_eq!(by_label["<24h"].count, 5);
        assert_eq!(by_label["24h"].count, 3);
        assert_eq!(by_label["7d"].count, 2);
        assert_eq!(by_label["30d"].count, 1);
        assert_eq!(by_label["60d"].count, 1);
        assert_eq!(by_label["90d+"].count, 1);

        let total: i64 = buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, 13);
        let under_24h_percent = by_label["<24h"].percent;
        assert!((38.4..=38.5).contains(&under_24h_percent), "got {under_24h_percent}");
    }

    /// S6: inserting the same rule twice with labels in a different order
    /// dedups to exactly one row, identified by the sorted-label identity key.
    #[tokio::test]
    async fn rules_usage_upsert_dedups_reordered_labels() {
        let provider = provider().await;
        let base = Utc::now();

        let first = RulesUsageItem {
            serie: "up".to_owned(),
            group_name: "group1".to_owned(),
            name: "AlwaysUp".to_owned(),
            expression: "up == 1".to_owned(),
            kind: RuleKind::Alert,
            labels: vec!["severity".to_owned(), "team".to_owned()],
        };
        let second = RulesUsageItem { labels: vec!["team".to_owned(), "severity".to_owned()], ..first.clone() };

        provider.insert_rules_usage(&[first]).await.expect("insert first");
        provider.insert_rules_usage(&[second]).await.expect("insert second");

        let tr = TimeRange::new(base - Duration::minutes(5), base + Duration::minutes(5));
        let rows = provider
            .get_rules_usage(RulesUsageParams {
                tr,
                filter: None,
                pagination: Pagination { page: 1, page_size: 50 },
                sort: SortSpec { sort_by: "last_seen_at".to_owned(), sort_order: SortOrder::Desc },
            })
            .await
            .expect("get_rules_usage");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "AlwaysUp");
    }
}
