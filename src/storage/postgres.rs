//! Postgres [`super::Provider`] implementation.
//!
//! Uses runtime-checked `sqlx::query`/`query_as` rather than the `query!`
//! macros: the schema is applied by embedded migrations at startup, so there
//! is no `DATABASE_URL` available at compile time for the macro's offline cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};

use crate::timerange::TimeRange;

use super::error::Error;
use super::types::*;
use super::Provider;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("src/storage/migrations/postgres");

pub struct PostgresProvider {
    pool: PgPool,
}

impl PostgresProvider {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|err| Error::ConnectionFailure {
                db_type: "postgres",
                details: err.to_string(),
            })?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Provider for PostgresProvider {
    async fn migrate(&self) -> Result<(), Error> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|cause| Error::SchemaFailure { db_type: "postgres", cause })
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
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
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
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$7) \
                 ON CONFLICT (serie, kind, group_name, name, expression, labels) \
                 DO UPDATE SET last_seen_at = $7",
            )
            .bind(&item.serie)
            .bind(item.kind.as_str())
            .bind(&item.group_name)
            .bind(&item.name)
            .bind(&item.expression)
            .bind(labels.join(","))
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
                 VALUES ($1,$2,$3,$4,$5,$5) \
                 ON CONFLICT (dashboard_id, serie) DO UPDATE SET last_seen_at = $5, name = $3, url = $4",
            )
            .bind(&item.id)
            .bind(&item.serie)
            .bind(&item.name)
            .bind(&item.url)
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
                "INSERT INTO metrics_catalog (name, metric_type, help, unit, updated_at) \
                 VALUES ($1,$2,$3,$4,$5) \
                 ON CONFLICT (name) DO UPDATE SET metric_type = $2, help = $3, unit = $4, updated_at = $5",
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
                "INSERT INTO metrics_job_index (name, job, updated_at) VALUES ($1,$2,$3) \
                 ON CONFLICT (name, job) DO UPDATE SET updated_at = $3",
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
                 now() \
             FROM metrics_catalog catalog \
             LEFT JOIN ( \
                 SELECT serie, \
                     COUNT(*) FILTER (WHERE kind = 'alert') AS alert_count, \
                     COUNT(*) FILTER (WHERE kind = 'record') AS record_count \
                 FROM rules_usage WHERE first_seen_at <= $2 AND last_seen_at >= $1 GROUP BY serie \
             ) r ON r.serie = catalog.name \
             LEFT JOIN ( \
                 SELECT serie, COUNT(DISTINCT dashboard_id) AS dashboard_count FROM dashboard_usage \
                 WHERE first_seen_at <= $2 AND last_seen_at >= $1 GROUP BY serie \
             ) d ON d.serie = catalog.name \
             LEFT JOIN ( \
                 SELECT label_matchers -> 0 ->> '__name__' AS name, COUNT(*) AS query_count, MAX(ts) AS last_queried_at \
                 FROM queries \
                 WHERE ts BETWEEN $1 AND $2 AND label_matchers IS NOT NULL \
                 GROUP BY label_matchers -> 0 ->> '__name__' \
             ) q ON q.name = catalog.name \
             ON CONFLICT (name) DO UPDATE SET \
                 alert_count = EXCLUDED.alert_count, \
                 record_count = EXCLUDED.record_count, \
                 dashboard_count = EXCLUDED.dashboard_count, \
                 query_count = EXCLUDED.query_count, \
                 last_queried_at = EXCLUDED.last_queried_at, \
                 refreshed_at = EXCLUDED.refreshed_at",
        )
        .bind(tr.from)
        .bind(tr.to)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::query("refresh_metrics_usage_summary", e))?;
        Ok(())
    }

    async fn delete_queries_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM queries WHERE ts < $1")
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
             FROM queries WHERE ts BETWEEN $1 AND $2 AND ($3::text IS NULL OR fingerprint = $3)",
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
             WHERE ts BETWEEN $1 AND $2 \
               AND ($3::text IS NULL OR fingerprint = $3) \
               AND ($4::text IS NULL OR label_matchers @> jsonb_build_array(jsonb_build_object('__name__', $4::text)))",
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
        let rows = sqlx::query(
            "SELECT time_bucket.bucket_ts AS ts, \
                COALESCE(COUNT(*) FILTER (WHERE q.status_code < 400), 0) AS success_count, \
                COALESCE(COUNT(*) FILTER (WHERE q.status_code >= 400), 0) AS error_count \
             FROM generate_series($1::timestamptz, $2::timestamptz, $3::interval) AS time_bucket(bucket_ts) \
             LEFT JOIN queries q ON q.ts >= time_bucket.bucket_ts AND q.ts < time_bucket.bucket_ts + $3::interval \
                AND ($4::text IS NULL OR q.fingerprint = $4) \
             GROUP BY time_bucket.bucket_ts ORDER BY time_bucket.bucket_ts",
        )
        .bind(tr.from)
        .bind(tr.to)
        .bind(granularity.postgres_interval())
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
        let rows = sqlx::query(
            "SELECT time_bucket.bucket_ts AS ts, \
                COALESCE(AVG(q.duration_ms), 0) AS avg_duration_ms, \
                COALESCE(PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY q.duration_ms), 0) AS p95_duration_ms \
             FROM generate_series($1::timestamptz, $2::timestamptz, $3::interval) AS time_bucket(bucket_ts) \
             LEFT JOIN queries q ON q.ts >= time_bucket.bucket_ts AND q.ts < time_bucket.bucket_ts + $3::interval \
                AND ($4::text IS NULL OR q.fingerprint = $4) \
             GROUP BY time_bucket.bucket_ts ORDER BY time_bucket.bucket_ts",
        )
        .bind(tr.from)
        .bind(tr.to)
        .bind(granularity.postgres_interval())
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::query("get_query_latency_trends", e))?;
        rows.into_iter()
            .map(|row| {
                Ok(LatencyTrendPoint {
                    ts: row.try_get("ts").map_err(|e| Error::query("get_query_latency_trends", e))?,
                    avg_duration_ms: row.try_get::<f64, _>("avg_duration_ms").map_err(|e| Error::query("get_query_latency_trends", e))?,
                    p95_duration_ms: row.try_get::<f64, _>("p95_duration_ms").map_err(|e| Error::query("get_query_latency_trends", e))?,
                })
            })
            .collect()
    }

    async fn get_query_throughput_analysis(&self, tr: TimeRange) -> Result<Vec<ThroughputPoint>, Error> {
        let granularity = crate::timerange::BucketGranularity::for_range(tr.from, tr.to);
        let rows = sqlx::query(
            "SELECT time_bucket.bucket_ts AS ts, COALESCE(COUNT(q.*), 0) AS count \
             FROM generate_series($1::timestamptz, $2::timestamptz, $3::interval) AS time_bucket(bucket_ts) \
             LEFT JOIN queries q ON q.ts >= time_bucket.bucket_ts AND q.ts < time_bucket.bucket_ts + $3::interval \
             GROUP BY time_bucket.bucket_ts ORDER BY time_bucket.bucket_ts",
        )
        .bind(tr.from)
        .bind(tr.to)
        .bind(granularity.postgres_interval())
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
        let rows = sqlx::query(
            "SELECT time_bucket.bucket_ts AS ts, \
                COALESCE(COUNT(*) FILTER (WHERE q.status_code >= 400), 0) AS error_count, \
                COALESCE(COUNT(q.*), 0) AS total_count \
             FROM generate_series($1::timestamptz, $2::timestamptz, $3::interval) AS time_bucket(bucket_ts) \
             LEFT JOIN queries q ON q.ts >= time_bucket.bucket_ts AND q.ts < time_bucket.bucket_ts + $3::interval \
                AND ($4::text IS NULL OR q.fingerprint = $4) \
             GROUP BY time_bucket.bucket_ts ORDER BY time_bucket.bucket_ts",
        )
        .bind(tr.from)
        .bind(tr.to)
        .bind(granularity.postgres_interval())
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
                COUNT(*) FILTER (WHERE end_param - start_param < interval '24 hours') AS b_lt24h, \
                COUNT(*) FILTER (WHERE end_param - start_param >= interval '24 hours' AND end_param - start_param < interval '7 days') AS b_24h, \
                COUNT(*) FILTER (WHERE end_param - start_param >= interval '7 days' AND end_param - start_param < interval '30 days') AS b_7d, \
                COUNT(*) FILTER (WHERE end_param - start_param >= interval '30 days' AND end_param - start_param < interval '60 days') AS b_30d, \
                COUNT(*) FILTER (WHERE end_param - start_param >= interval '60 days' AND end_param - start_param < interval '90 days') AS b_60d, \
                COUNT(*) FILTER (WHERE end_param - start_param >= interval '90 days') AS b_90d \
             FROM queries \
             WHERE ts BETWEEN $1 AND $2 AND query_type = 'range' AND start_param IS NOT NULL AND end_param IS NOT NULL",
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
                MAX(peak_samples) AS peak_samples, (ARRAY_AGG(query_param ORDER BY ts DESC))[1] AS query_param \
             FROM queries WHERE ts BETWEEN $1 AND $2 \
             GROUP BY fingerprint ORDER BY {} {} LIMIT $3 OFFSET $4",
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
             WHERE ts BETWEEN $1 AND $2 AND fingerprint = $3 AND ($4::text IS NULL OR query_type = $4) \
             ORDER BY ts DESC LIMIT $5 OFFSET $6",
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
             WHERE ts BETWEEN $1 AND $2 AND label_matchers @> jsonb_build_array(jsonb_build_object('__name__', $3::text)) \
             GROUP BY query_param ORDER BY {} {} LIMIT $4 OFFSET $5",
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
                    avg_duration_ms: row.try_get::<f64, _>("avg_duration_ms").map_err(|e| Error::query("get_queries_by_serie_name", e))?,
                    avg_peak_samples: row.try_get::<f64, _>("avg_peak_samples").map_err(|e| Error::query("get_queries_by_serie_name", e))?,
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
                WHERE first_seen_at <= $2 AND last_seen_at >= $1 \
             ) ranked \
             WHERE rn = 1 AND ($3::text IS NULL OR name ILIKE '%' || $3 || '%' OR expression ILIKE '%' || $3 || '%') \
             ORDER BY {} {} LIMIT $4 OFFSET $5",
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
                WHERE first_seen_at <= $2 AND last_seen_at >= $1 \
             ) ranked \
             WHERE rn = 1 AND ($3::text IS NULL OR name ILIKE '%' || $3 || '%' OR url ILIKE '%' || $3 || '%') \
             ORDER BY {} {} LIMIT $4 OFFSET $5",
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
             WHERE ($1::text IS NULL OR c.metric_type = $1) \
               AND ($2::text IS NULL OR j.job = $2) \
               AND ($3::text IS NULL OR c.name ILIKE '%' || $3 || '%') \
               AND ($4 = FALSE OR COALESCE(s.alert_count, 0) + COALESCE(s.record_count, 0) + \
                    COALESCE(s.dashboard_count, 0) + COALESCE(s.query_count, 0) = 0) \
             ORDER BY c.name LIMIT $5 OFFSET $6",
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
        let rows = sqlx::query(
            "SELECT c.name, c.metric_type, c.help, c.unit, \
                COALESCE(s.alert_count, 0) AS alert_count, COALESCE(s.record_count, 0) AS record_count, \
                COALESCE(s.dashboard_count, 0) AS dashboard_count, COALESCE(s.query_count, 0) AS query_count, \
                s.last_queried_at \
             FROM metrics_catalog c \
             LEFT JOIN metrics_usage_summary s ON s.name = c.name \
             LEFT JOIN metrics_job_index j ON j.name = c.name \
             WHERE c.name = ANY($1) AND ($2::text IS NULL OR j.job = $2) \
             GROUP BY c.name, c.metric_type, c.help, c.unit, s.alert_count, s.record_count, s.dashboard_count, s.query_count, s.last_queried_at",
        )
        .bind(names)
        .bind(job)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::query("get_series_metadata_by_names", e))?;
        rows.into_iter().map(row_to_series_metadata).collect()
    }

    async fn get_metric_statistics(&self, tr: TimeRange, name: &str) -> Result<MetricStatistics, Error> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE kind = 'alert' AND last_seen_at BETWEEN $2 AND $3) AS alert_count, \
                COUNT(*) FILTER (WHERE kind = 'record' AND last_seen_at BETWEEN $2 AND $3) AS record_count, \
                COUNT(*) FILTER (WHERE kind = 'alert') AS total_alert_count, \
                COUNT(*) FILTER (WHERE kind = 'record') AS total_record_count \
             FROM rules_usage WHERE serie = $1",
        )
        .bind(name)
        .bind(tr.from)
        .bind(tr.to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::query("get_metric_statistics.rules", e))?;
        let dash_row = sqlx::query(
            "SELECT COUNT(*) FILTER (WHERE last_seen_at BETWEEN $2 AND $3) AS dashboard_count, COUNT(*) AS total_dashboard_count \
             FROM dashboard_usage WHERE serie = $1",
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
             WHERE ts BETWEEN $1 AND $2 AND label_matchers @> jsonb_build_array(jsonb_build_object('__name__', $3::text))",
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

async fn avg_duration(pool: &PgPool, tr: TimeRange, fingerprint: Option<&str>) -> Result<f64, Error> {
    let row = sqlx::query(
        "SELECT COALESCE(AVG(duration_ms), 0) AS avg_duration_ms FROM queries \
         WHERE ts BETWEEN $1 AND $2 AND ($3::text IS NULL OR fingerprint = $3)",
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

/// Safe because `sort_by` is always pre-validated against a fixed allow-list
/// in [`crate::timerange::validate_sort_field`] before it reaches here.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', ""))
}

fn row_to_rules_usage(row: sqlx::postgres::PgRow) -> Result<RulesUsageRow, Error> {
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

fn row_to_dashboard_usage(row: sqlx::postgres::PgRow) -> Result<DashboardUsageRow, Error> {
    Ok(DashboardUsageRow {
        id: row.try_get("dashboard_id").map_err(|e| Error::query("get_dashboard_usage", e))?,
        serie: row.try_get("serie").map_err(|e| Error::query("get_dashboard_usage", e))?,
        name: row.try_get("name").map_err(|e| Error::query("get_dashboard_usage", e))?,
        url: row.try_get("url").map_err(|e| Error::query("get_dashboard_usage", e))?,
        first_seen_at: row.try_get("first_seen_at").map_err(|e| Error::query("get_dashboard_usage", e))?,
        last_seen_at: row.try_get("last_seen_at").map_err(|e| Error::query("get_dashboard_usage", e))?,
    })
}

fn row_to_series_metadata(row: sqlx::postgres::PgRow) -> Result<SeriesMetadataRow, Error> {
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
