//! Process entrypoint and graceful-shutdown wiring (C12).

mod catalog_buffer;
mod config;
mod error;
mod fingerprint;
mod ingest;
mod inventory;
mod observability;
mod otlp;
mod retention;
mod services;
mod sql_guard;
mod storage;
mod timerange;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::MetricsServiceServer;
use tokio::sync::watch;
use tonic::transport::Server;

use crate::catalog_buffer::CatalogSyncBuffer;
use crate::inventory::AlwaysLeader;
use crate::otlp::cache;
use crate::otlp::{Filter, FilterParams};
use crate::services::Services;

/// Analytics plane for a Prometheus deployment: query-log ingestion, a
/// metrics usage catalog, and an OTLP filter that drops unused series.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to a TOML configuration file, layered over embedded defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let Err(err) = try_main().await else {
        return ExitCode::SUCCESS;
    };
    eprintln!("Error: {}", error::DisplayWithSources { error: &err, infix: "\n    Caused by: " });
    ExitCode::FAILURE
}

async fn try_main() -> Result<(), error::Main> {
    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;
    let _guard = observability::init_tracing(&config.observability)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (services, ingest_handle) = Services::build(&config, shutdown_rx.clone()).await?;
    let Services { provider, metrics, ingester } = services;
    // Kept alive for the process lifetime: the query-log ingress that would
    // call `Ingester::submit` lives on the reverse-proxy layer, out of scope
    // here (see Non-goals). C3's worker is driven by `shutdown_tx`, not by
    // this sender's lifetime, so holding it idle is harmless.
    let _ingester = ingester;

    let catalog_buffer = CatalogSyncBuffer::new(&config.ingester.catalog_sync);
    let catalog_handle = catalog_buffer::spawn(
        catalog_buffer.clone(),
        config.ingester.catalog_sync.clone(),
        provider.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    );

    let inventory_handle = tokio::spawn(inventory::run(
        config.inventory.clone(),
        provider.clone(),
        Arc::new(AlwaysLeader),
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    let retention_handle = tokio::spawn(retention::run(config.retention.clone(), provider.clone(), metrics.clone(), shutdown_rx.clone()));

    let filter = Filter::new(
        FilterParams {
            provider: provider.clone(),
            cache: cache::build(&config.ingester.redis),
            catalog_buffer,
            metrics: metrics.clone(),
            allowed_jobs: config.ingester.allowed_jobs.clone(),
            denied_jobs: config.ingester.denied_jobs.clone(),
            dry_run: config.ingester.dry_run,
            cache_ttl: config.ingester.redis.ttl(),
        },
        config.ingester.protocol,
        &config.ingester.otlp,
    )?;

    let otlp_addr: std::net::SocketAddr = config
        .ingester
        .otlp
        .listen_address
        .parse()
        .map_err(|_| error::Config::Invalid(format!("invalid ingester.otlp.listen_address: {}", config.ingester.otlp.listen_address)))?;
    let mut otlp_shutdown_rx = shutdown_rx.clone();
    let otlp_handle = tokio::spawn(async move {
        Server::builder()
            .add_service(MetricsServiceServer::new(filter))
            .serve_with_shutdown(otlp_addr, async move {
                let _ = otlp_shutdown_rx.changed().await;
            })
            .await
    });

    let admin_addr: std::net::SocketAddr = config
        .observability
        .metrics_listen_address
        .parse()
        .map_err(|_| error::Config::Invalid(format!("invalid observability.metrics_listen_address: {}", config.observability.metrics_listen_address)))?;
    let admin_router = observability::admin_router(metrics.clone(), provider.clone());
    let mut admin_shutdown_rx = shutdown_rx.clone();
    let admin_handle = tokio::spawn(observability::serve_admin(admin_addr, admin_router, async move {
        let _ = admin_shutdown_rx.changed().await;
    }));

    tracing::info!(otlp_addr = %otlp_addr, admin_addr = %admin_addr, "promscoped started");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    // C5 stops accepting new RPCs and drains, bounded by GracefulShutdownTimeout.
    if tokio::time::timeout(config.ingester.graceful_shutdown_timeout(), otlp_handle).await.is_err() {
        tracing::warn!("OTLP server did not drain within the graceful shutdown timeout");
    }

    // C3 drains under its own internally-bounded ShutdownGracePeriod.
    let _ = ingest_handle.await;

    // C6 performs its final flush as part of exiting its loop.
    let _ = catalog_handle.await;

    // C7/C4 exit at their next check.
    let _ = retention_handle.await;
    let _ = inventory_handle.await;

    if tokio::time::timeout(std::time::Duration::from_secs(5), admin_handle).await.is_err() {
        tracing::warn!("admin HTTP server did not shut down in time");
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
            std::future::pending::<()>().await;
            return;
        };
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
