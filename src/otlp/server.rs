//! The OTLP gRPC `MetricsService` ingress: classifies every metric in an
//! export request against the usage catalog and drops the ones that are
//! definitively unused before forwarding downstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::MetricsService;
use opentelemetry_proto::tonic::collector::metrics::v1::{ExportMetricsServiceRequest, ExportMetricsServiceResponse};
use opentelemetry_proto::tonic::common::v1::any_value;
use opentelemetry_proto::tonic::metrics::v1::{metric::Data, Metric, ResourceMetrics};
use opentelemetry_proto::tonic::resource::v1::Resource;
use prost::Message;
use tonic::{transport::Channel, Request, Response, Status};

use super::cache::StateCache;
use super::classify::{self, MetricShape, SeriesState};
use super::Error;
use crate::catalog_buffer::CatalogSyncBuffer;
use crate::config::{EgressProtocol, OtlpConfig};
use crate::observability::Metrics;
use crate::storage::Provider;

type GrpcClient = opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient<Channel>;

#[derive(Clone)]
enum Downstream {
    Grpc(GrpcClient),
    Http { client: reqwest::Client, url: String },
}

impl Downstream {
    fn connect(protocol: EgressProtocol, config: &OtlpConfig) -> Result<Self, Error> {
        match protocol {
            EgressProtocol::Otlp => {
                let endpoint = tonic::transport::Endpoint::from_shared(config.downstream_address.clone())
                    .map_err(|e| Error::DownstreamConnect(config.downstream_address.clone(), e))?;
                let channel = endpoint.connect_lazy();
                Ok(Self::Grpc(GrpcClient::new(channel)))
            }
            EgressProtocol::OtlpHttp => Ok(Self::Http {
                client: reqwest::Client::new(),
                url: format!("{}/v1/metrics", config.downstream_address.trim_end_matches('/')),
            }),
        }
    }

    async fn forward(&self, request: ExportMetricsServiceRequest) -> Result<(), Error> {
        match self {
            Self::Grpc(client) => {
                let mut client = client.clone();
                client.export(Request::new(request)).await.map_err(Error::DownstreamGrpc)?;
                Ok(())
            }
            Self::Http { client, url } => {
                let body = request.encode_to_vec();
                client
                    .post(url)
                    .header("content-type", "application/x-protobuf")
                    .body(body)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(Error::DownstreamHttp)?;
                Ok(())
            }
        }
    }
}

/// Everything [`Filter`] needs, gathered into one struct so `Services`
/// construction stays a single call.
pub struct FilterParams {
    pub provider: Arc<dyn Provider>,
    pub cache: Arc<dyn StateCache>,
    pub catalog_buffer: CatalogSyncBuffer,
    pub metrics: Arc<Metrics>,
    pub allowed_jobs: Vec<String>,
    pub denied_jobs: Vec<String>,
    pub dry_run: bool,
    pub cache_ttl: Duration,
}

/// The OTLP `MetricsService` server implementation (C5).
pub struct Filter {
    provider: Arc<dyn Provider>,
    cache: Arc<dyn StateCache>,
    catalog_buffer: CatalogSyncBuffer,
    metrics: Arc<Metrics>,
    allowed_jobs: Vec<String>,
    denied_jobs: Vec<String>,
    dry_run: bool,
    cache_ttl: Duration,
    downstream: Downstream,
}

impl Filter {
    pub fn new(params: FilterParams, protocol: EgressProtocol, otlp: &OtlpConfig) -> Result<Self, Error> {
        Ok(Self {
            provider: params.provider,
            cache: params.cache,
            catalog_buffer: params.catalog_buffer,
            metrics: params.metrics,
            allowed_jobs: params.allowed_jobs,
            denied_jobs: params.denied_jobs,
            dry_run: params.dry_run,
            cache_ttl: params.cache_ttl,
            downstream: Downstream::connect(protocol, otlp)?,
        })
    }

    fn in_scope(&self, job: &str) -> bool {
        if !self.allowed_jobs.is_empty() {
            self.allowed_jobs.iter().any(|allowed| allowed == job)
        } else if !self.denied_jobs.is_empty() {
            !self.denied_jobs.iter().any(|denied| denied == job)
        } else {
            true
        }
    }

    /// Classifies and, unless [`Self::dry_run`], mutates `rm` in place.
    /// Catalog enqueue happens for every metric regardless of scope.
    async fn filter_resource(&self, rm: &mut ResourceMetrics) {
        let job = job_from_resource(rm.resource.as_ref());

        struct MetricInfo {
            shape: MetricShape,
            keys: Vec<String>,
        }

        let mut infos: Vec<Vec<Option<MetricInfo>>> = Vec::with_capacity(rm.scope_metrics.len());
        let mut all_keys: Vec<String> = Vec::new();

        for sm in &rm.scope_metrics {
            let mut scope_infos = Vec::with_capacity(sm.metrics.len());
            for metric in &sm.metrics {
                match metric_shape(metric) {
                    Some((shape, type_str)) => {
                        self.catalog_buffer.enqueue(&metric.name, type_str);
                        let keys = classify::lookup_keys(&metric.name, shape);
                        all_keys.extend(keys.iter().cloned());
                        scope_infos.push(Some(MetricInfo { shape, keys }));
                    }
                    None => scope_infos.push(None),
                }
            }
            infos.push(scope_infos);
        }

        if !self.in_scope(&job) {
            return;
        }

        all_keys.sort_unstable();
        all_keys.dedup();
        if all_keys.is_empty() {
            return;
        }

        let cache_hits = self.cache.get_states(&all_keys).await;
        self.metrics.otlp_filter_cache_hits_total.inc_by(cache_hits.len() as u64);
        let misses: Vec<String> = all_keys.iter().filter(|k| !cache_hits.contains_key(*k)).cloned().collect();
        self.metrics.otlp_filter_cache_misses_total.inc_by(misses.len() as u64);

        let catalog_rows: HashMap<String, bool> = if misses.is_empty() {
            HashMap::new()
        } else {
            let job_filter = if job.is_empty() { None } else { Some(job.as_str()) };
            match self.provider.get_series_metadata_by_names(&misses, job_filter).await {
                Ok(rows) => rows.into_iter().map(|row| (row.name.clone(), row.is_used())).collect(),
                Err(err) => {
                    tracing::debug!(
                        error = %crate::error::DisplayWithSources { error: &err, infix: ": " },
                        "classification lookup failed, keeping affected metrics fail-open"
                    );
                    HashMap::new()
                }
            }
        };

        let resolved = classify::resolve_states(&all_keys, &cache_hits, &catalog_rows);
        let to_cache: HashMap<String, SeriesState> =
            resolved.iter().filter(|(key, _)| misses.contains(key)).map(|(key, state)| (key.clone(), *state)).collect();
        if !to_cache.is_empty() {
            self.cache.set_states(&to_cache, self.cache_ttl).await;
        }

        let dry_run_label = if self.dry_run { "true" } else { "false" };
        for (sm, scope_infos) in rm.scope_metrics.iter_mut().zip(infos.iter()) {
            let mut keep_flags = Vec::with_capacity(sm.metrics.len());
            for info in scope_infos {
                let keep = match info {
                    None => true,
                    Some(MetricInfo { shape, keys }) => {
                        let states: Vec<SeriesState> =
                            keys.iter().map(|key| *resolved.get(key).unwrap_or(&SeriesState::Unknown)).collect();
                        let has_unknown = states.iter().any(|s| matches!(s, SeriesState::Unknown));
                        let keep = classify::should_keep(*shape, &states);
                        if keep {
                            if has_unknown {
                                self.metrics.otlp_filter_metrics_unknown_total.with_label_values(&[dry_run_label]).inc();
                            } else {
                                self.metrics.otlp_filter_metrics_kept_total.with_label_values(&[dry_run_label]).inc();
                            }
                        } else {
                            self.metrics.otlp_filter_metrics_dropped_total.with_label_values(&[dry_run_label]).inc();
                        }
                        keep
                    }
                };
                keep_flags.push(keep);
            }
            if !self.dry_run {
                let mut idx = 0;
                sm.metrics.retain(|_| {
                    let keep = keep_flags[idx];
                    idx += 1;
                    keep
                });
            }
        }

        rm.scope_metrics.retain(|sm| !sm.metrics.is_empty());
    }
}

#[async_trait::async_trait]
impl MetricsService for Filter {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let mut req = request.into_inner();

        for rm in &mut req.resource_metrics {
            self.filter_resource(rm).await;
        }
        req.resource_metrics.retain(|rm| !rm.scope_metrics.is_empty());

        self.downstream.forward(req).await.map_err(|err| Status::unavailable(err.to_string()))?;

        Ok(Response::new(ExportMetricsServiceResponse { partial_success: None }))
    }
}

fn job_from_resource(resource: Option<&Resource>) -> String {
    resource
        .and_then(|r| r.attributes.iter().find(|kv| kv.key == "service.name"))
        .and_then(|kv| kv.value.as_ref())
        .and_then(|v| v.value.as_ref())
        .and_then(|v| match v {
            any_value::Value::StringValue(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

fn metric_shape(metric: &Metric) -> Option<(MetricShape, &'static str)> {
    match metric.data.as_ref()? {
        Data::Gauge(_) => Some((MetricShape::Simple, "gauge")),
        Data::Sum(sum) => Some((MetricShape::Simple, if sum.is_monotonic { "counter" } else { "gauge" })),
        Data::Histogram(_) | Data::ExponentialHistogram(_) => Some((MetricShape::Histogram, "histogram")),
        Data::Summary(_) => Some((MetricShape::Summary, "summary")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_from_resource_reads_service_name() {
        use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};

        let resource = Resource {
            attributes: vec![KeyValue {
                key: "service.name".to_owned(),
                value: Some(AnyValue { value: Some(any_value::Value::StringValue("node-exporter".to_owned())) }),
            }],
            dropped_attributes_count: 0,
        };
        assert_eq!(job_from_resource(Some(&resource)), "node-exporter");
    }

    #[test]
    fn job_from_resource_defaults_to_empty_string() {
        assert_eq!(job_from_resource(None), "");
    }

    fn gauge_metric(name: &str) -> Metric {
        use opentelemetry_proto::tonic::metrics::v1::Gauge;
        Metric { name: name.to_owned(), data: Some(Data::Gauge(Gauge::default())), ..Default::default() }
    }

    fn histogram_metric(name: &str) -> Metric {
        use opentelemetry_proto::tonic::metrics::v1::Histogram;
        Metric { name: name.to_owned(), data: Some(Data::Histogram(Histogram::default())), ..Default::default() }
    }

    fn resource_metrics(job: &str, metrics: Vec<Metric>) -> ResourceMetrics {
        use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
        use opentelemetry_proto::tonic::metrics::v1::ScopeMetrics;

        ResourceMetrics {
            resource: Some(Resource {
                attributes: vec![KeyValue {
                    key: "service.name".to_owned(),
                    value: Some(AnyValue { value: Some(any_value::Value::StringValue(job.to_owned())) }),
                }],
                dropped_attributes_count: 0,
            }),
            scope_metrics: vec![ScopeMetrics { scope: None, metrics, schema_url: String::new() }],
            schema_url: String::new(),
        }
    }

    async fn test_filter(provider: Arc<dyn Provider>, dry_run: bool) -> Filter {
        use crate::catalog_buffer::CatalogSyncBuffer;
        use crate::config::CatalogSyncConfig;
        use crate::observability::Metrics;
        use crate::otlp::cache::MemoryCache;

        Filter::new(
            FilterParams {
                provider,
                cache: Arc::new(MemoryCache::new()),
                catalog_buffer: CatalogSyncBuffer::new(&CatalogSyncConfig::default()),
                metrics: Arc::new(Metrics::new().expect("build metrics registry")),
                allowed_jobs: Vec::new(),
                denied_jobs: Vec::new(),
                dry_run,
                cache_ttl: Duration::from_secs(60),
            },
            EgressProtocol::Otlp,
            &OtlpConfig { listen_address: "0.0.0.0:0".to_owned(), downstream_address: "http://127.0.0.1:4317".to_owned() },
        )
        .expect("construct filter with a lazily-connected downstream")
    }

    async fn seeded_provider() -> Arc<dyn Provider> {
        use crate::storage::sqlite::SqliteProvider;
        use crate::storage::types::{CatalogItem, JobIndexItem, NewQuery, QueryType};

        let provider = SqliteProvider::connect(":memory:").await.expect("open in-memory sqlite");
        provider.migrate().await.expect("run migrations");

        provider
            .upsert_metrics_catalog(&[
                CatalogItem { name: "used_metric".to_owned(), metric_type: "gauge".to_owned(), help: String::new(), unit: String::new() },
                CatalogItem { name: "unused_metric".to_owned(), metric_type: "gauge".to_owned(), help: String::new(), unit: String::new() },
            ])
            .await
            .expect("seed catalog");
        provider
            .upsert_metrics_job_index(&[
                JobIndexItem { name: "used_metric".to_owned(), job: "node".to_owned() },
                JobIndexItem { name: "unused_metric".to_owned(), job: "node".to_owned() },
            ])
            .await
            .expect("seed job index");
        provider
            .insert_queries(&[NewQuery {
                ts: chrono::Utc::now(),
                query_param: "used_metric".to_owned(),
                time_param: None,
                duration_ms: 5,
                status_code: 200,
                body_size: 16,
                fingerprint: "fp".to_owned(),
                label_matchers: Some(serde_json::json!([{"__name__": "used_metric"}])),
                query_type: QueryType::Instant,
                step: None,
                start: None,
                end: None,
                total_queryable_samples: 0,
                peak_samples: 0,
            }])
            .await
            .expect("seed one query against used_metric");
        provider.refresh_metrics_usage_summary(crate::timerange::TimeRange::default_window()).await.expect("refresh summary");

        Arc::from(Box::new(provider) as Box<dyn Provider>)
    }

    /// S4: a used and an unused gauge in one export; downstream should only
    /// keep `used_metric`. The dry-run variant passes both through unchanged.
    #[tokio::test]
    async fn used_unused_gauge_classification() {
        let provider = seeded_provider().await;

        let filter = test_filter(provider.clone(), false).await;
        let mut rm = resource_metrics("node", vec![gauge_metric("used_metric"), gauge_metric("unused_metric")]);
        filter.filter_resource(&mut rm).await;
        let kept: Vec<&str> = rm.scope_metrics.iter().flat_map(|sm| sm.metrics.iter().map(|m| m.name.as_str())).collect();
        assert_eq!(kept, vec!["used_metric"]);

        let dry_run_filter = test_filter(provider, true).await;
        let mut rm = resource_metrics("node", vec![gauge_metric("used_metric"), gauge_metric("unused_metric")]);
        dry_run_filter.filter_resource(&mut rm).await;
        let kept: Vec<&str> = rm.scope_metrics.iter().flat_map(|sm| sm.metrics.iter().map(|m| m.name.as_str())).collect();
        assert_eq!(kept, vec!["used_metric", "unused_metric"]);
    }

    /// S5: a histogram whose `_bucket`/`_count` variants are catalogued as
    /// unused but whose `_sum` variant has no catalog row at all (unknown)
    /// is kept, since composite metrics fail open on any unknown variant.
    #[tokio::test]
    async fn histogram_kept_on_partial_unknown_variant() {
        use crate::storage::types::CatalogItem;

        let provider = seeded_provider().await;
        provider
            .upsert_metrics_catalog(&[
                CatalogItem { name: "h_bucket".to_owned(), metric_type: "histogram".to_owned(), help: String::new(), unit: String::new() },
                CatalogItem { name: "h_count".to_owned(), metric_type: "histogram".to_owned(), help: String::new(), unit: String::new() },
            ])
            .await
            .expect("seed histogram catalog rows");
        provider
            .upsert_metrics_job_index(&[
                crate::storage::types::JobIndexItem { name: "h_bucket".to_owned(), job: "node".to_owned() },
                crate::storage::types::JobIndexItem { name: "h_count".to_owned(), job: "node".to_owned() },
            ])
            .await
            .expect("seed histogram job index");
        provider
            .refresh_metrics_usage_summary(crate::timerange::TimeRange::default_window())
            .await
            .expect("refresh summary");

        let filter = test_filter(provider, false).await;
        let mut rm = resource_metrics("node", vec![histogram_metric("h")]);
        filter.filter_resource(&mut rm).await;
        let kept: Vec<&str> = rm.scope_metrics.iter().flat_map(|sm| sm.metrics.iter().map(|m| m.name.as_str())).collect();
        assert_eq!(kept, vec!["h"]);
    }
}
