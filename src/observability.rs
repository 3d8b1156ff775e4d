//! Facilities for observing runtime behavior: structured logging and the
//! Prometheus metrics registry (C11).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use http::StatusCode;
use prometheus::{Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tower_http::trace::TraceLayer;

use crate::config::{LogFormat, ObservabilityConfig};
use crate::error;
use crate::storage::Provider;

/// Cleans up tracing resources when dropped. Kept even though this build has
/// nothing to flush, so a future exporter (e.g. an OTLP trace pipeline) has
/// somewhere to hook in.
pub struct Guard;

/// Installs the global `tracing` subscriber: an `EnvFilter` seeded from
/// config (overridable via `RUST_LOG`) and a human or JSON formatting layer.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<Guard, error::Observability> {
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer();
    let fmt_layer = match config.log_format {
        LogFormat::Pretty => fmt_layer.pretty().boxed(),
        LogFormat::Json => fmt_layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(error::Observability::SetSubscriber)?;

    Ok(Guard)
}

/// Every counter/histogram this binary exposes under `GET /metrics`.
pub struct Metrics {
    registry: Registry,

    pub ingest_dropped_total: IntCounterVec,
    pub ingest_flushed_total: IntCounter,
    pub ingest_flush_errors_total: IntCounter,
    pub query_ingester_batch_size: Histogram,

    pub inventory_sync_duration_seconds: Histogram,
    pub inventory_sync_success_total: IntCounter,
    pub inventory_sync_failure_total: IntCounter,

    pub retention_run_duration_seconds: HistogramVec,
    pub retention_deleted_total: IntCounter,
    pub retention_failure_total: IntCounter,

    pub catalog_sync_buffer_size: IntGauge,
    pub catalog_sync_buffer_flush_total: IntCounterVec,

    pub otlp_filter_metrics_kept_total: IntCounterVec,
    pub otlp_filter_metrics_dropped_total: IntCounterVec,
    pub otlp_filter_metrics_unknown_total: IntCounterVec,
    pub otlp_filter_cache_hits_total: IntCounter,
    pub otlp_filter_cache_misses_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, error::Observability> {
        let registry = Registry::new();

        let ingest_dropped_total = IntCounterVec::new(
            Opts::new("query_ingester_dropped_queries_total", "Query-log entries dropped before reaching storage"),
            &["reason"],
        )?;
        let ingest_flushed_total =
            IntCounter::new("query_ingester_flushed_total", "Query-log entries successfully persisted")?;
        let ingest_flush_errors_total =
            IntCounter::new("query_ingester_flush_errors_total", "Batch flushes that failed to persist")?;
        let query_ingester_batch_size = Histogram::with_opts(
            HistogramOpts::new("query_ingester_batch_size", "Size of batches flushed to storage")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 200.0, 500.0]),
        )?;

        let inventory_sync_duration_seconds =
            Histogram::with_opts(HistogramOpts::new("inventory_sync_duration_seconds", "Duration of one inventory sync tick"))?;
        let inventory_sync_success_total =
            IntCounter::new("inventory_sync_success_total", "Inventory sync ticks that completed all steps")?;
        let inventory_sync_failure_total =
            IntCounter::new("inventory_sync_failure_total", "Inventory sync ticks that aborted early")?;

        let retention_run_duration_seconds = HistogramVec::new(
            HistogramOpts::new("retention_run_duration_seconds", "Duration of one retention cycle"),
            &["status"],
        )?;
        let retention_deleted_total = IntCounter::new("retention_deleted_total", "Query rows deleted by retention")?;
        let retention_failure_total = IntCounter::new("retention_failure_total", "Retention cycles that failed or timed out")?;

        let catalog_sync_buffer_size = IntGauge::new("catalog_sync_buffer_size", "Entries currently pending in the catalog sync buffer")?;
        let catalog_sync_buffer_flush_total = IntCounterVec::new(
            Opts::new("catalog_sync_buffer_flush_total", "Catalog sync buffer flush attempts"),
            &["status"],
        )?;

        let otlp_filter_metrics_kept_total = IntCounterVec::new(
            Opts::new("otlp_filter_metrics_kept_total", "OTLP metrics forwarded unchanged"),
            &["dry_run"],
        )?;
        let otlp_filter_metrics_dropped_total = IntCounterVec::new(
            Opts::new("otlp_filter_metrics_dropped_total", "OTLP metrics classified unused and dropped"),
            &["dry_run"],
        )?;
        let otlp_filter_metrics_unknown_total = IntCounterVec::new(
            Opts::new("otlp_filter_metrics_unknown_total", "OTLP metrics with unresolvable classification, kept fail-open"),
            &["dry_run"],
        )?;
        let otlp_filter_cache_hits_total = IntCounter::new("otlp_filter_cache_hits_total", "OTLP filter classification cache hits")?;
        let otlp_filter_cache_misses_total =
            IntCounter::new("otlp_filter_cache_misses_total", "OTLP filter classification cache misses")?;

        macro_rules! register_all {
            ($($metric:expr),+ $(,)?) => {
                $(registry.register(Box::new($metric.clone()))?;)+
            };
        }
        register_all!(
            ingest_dropped_total,
            ingest_flushed_total,
            ingest_flush_errors_total,
            query_ingester_batch_size,
            inventory_sync_duration_seconds,
            inventory_sync_success_total,
            inventory_sync_failure_total,
            retention_run_duration_seconds,
            retention_deleted_total,
            retention_failure_total,
            catalog_sync_buffer_size,
            catalog_sync_buffer_flush_total,
            otlp_filter_metrics_kept_total,
            otlp_filter_metrics_dropped_total,
            otlp_filter_metrics_unknown_total,
            otlp_filter_cache_hits_total,
            otlp_filter_cache_misses_total,
        );

        Ok(Self {
            registry,
            ingest_dropped_total,
            ingest_flushed_total,
            ingest_flush_errors_total,
            query_ingester_batch_size,
            inventory_sync_duration_seconds,
            inventory_sync_success_total,
            inventory_sync_failure_total,
            retention_run_duration_seconds,
            retention_deleted_total,
            retention_failure_total,
            catalog_sync_buffer_size,
            catalog_sync_buffer_flush_total,
            otlp_filter_metrics_kept_total,
            otlp_filter_metrics_dropped_total,
            otlp_filter_metrics_unknown_total,
            otlp_filter_cache_hits_total,
            otlp_filter_cache_misses_total,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn export(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }
}

#[derive(Clone)]
struct AdminState {
    metrics: Arc<Metrics>,
    provider: Arc<dyn Provider>,
}

/// Builds the admin HTTP router: `/healthz`, `/readyz`, `/metrics`.
pub fn admin_router(metrics: Arc<Metrics>, provider: Arc<dyn Provider>) -> Router {
    let state = AdminState { metrics, provider };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AdminState>) -> impl IntoResponse {
    match state.provider.ping().await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            tracing::warn!(error = %error::DisplayWithSources { error: &err, infix: ": " }, "readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    match state.metrics.export() {
        Ok(body) => (StatusCode::OK, [(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(err) => {
            tracing::error!(%err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Binds and serves the admin HTTP surface until `shutdown` fires.
pub async fn serve_admin(
    addr: SocketAddr,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), error::Serve> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| error::Serve::AdminBind(e, addr))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| error::Serve::AdminBind(e, addr))?;
    Ok(())
}
