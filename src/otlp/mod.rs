//! OTLP Metrics Filter (C5): an OTLP gRPC `MetricsService` ingress that
//! drops data for metrics classified as unused before forwarding to a
//! downstream collector, with catalog auto-sync (C6) folded in on the same
//! per-metric traversal.

pub mod cache;
pub mod classify;
pub mod server;

use thiserror::Error;

/// Errors from the OTLP filter. Classification failures never surface here —
/// per §7 they're swallowed and degrade to fail-open — only forwarding and
/// startup errors are represented.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to downstream OTLP/gRPC collector at {0}")]
    DownstreamConnect(String, #[source] tonic::transport::Error),

    #[error("downstream OTLP/gRPC export failed")]
    DownstreamGrpc(#[source] tonic::Status),

    #[error("downstream OTLP/HTTP export failed")]
    DownstreamHttp(#[source] reqwest::Error),
}

pub use server::{Filter, FilterParams};
