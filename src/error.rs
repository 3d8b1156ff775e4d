//! Top-level error taxonomy and error-chain formatting.

use std::{fmt, iter, path::PathBuf};

use thiserror::Error;

/// Formats an [`Error`][0] and its [`source`][1]s with a separator, so fatal
/// startup errors can be logged with their full cause chain in one line.
///
/// [0]: std::error::Error
/// [1]: std::error::Error::source
pub struct DisplayWithSources<'a> {
    /// The error (and its sources) to write.
    pub error: &'a dyn std::error::Error,
    /// Separator written between the original error and subsequent sources.
    pub infix: &'static str,
}

impl fmt::Display for DisplayWithSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        let mut source = self.error.source();
        source
            .into_iter()
            .chain(iter::from_fn(|| {
                source = source.and_then(std::error::Error::source);
                source
            }))
            .try_for_each(|source| write!(f, "{}{source}", self.infix))
    }
}

/// Top-level errors surfaced from `main`.
#[derive(Error, Debug)]
pub enum Main {
    #[error("failed to load configuration")]
    Config(#[from] Config),

    #[error("failed to initialize observability")]
    Observability(#[from] Observability),

    #[error("failed to open or migrate the storage provider")]
    Storage(#[source] crate::storage::Error),

    #[error("failed to construct the OTLP filter")]
    Otlp(#[from] crate::otlp::Error),

    #[error("failed to serve requests")]
    Serve(#[from] Serve),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum Config {
    #[error("failed to read configuration file {1:?}")]
    Read(#[source] std::io::Error, PathBuf),

    #[error("failed to parse configuration")]
    Parse(#[from] figment::Error),

    #[error("invalid configuration value: {0}")]
    Invalid(String),
}

/// Observability initialization errors.
#[derive(Error, Debug)]
pub enum Observability {
    #[error("failed to install the global tracing subscriber")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("failed to register a metric with the Prometheus registry")]
    Registry(#[from] prometheus::Error),
}

/// Errors serving traffic (admin HTTP surface and OTLP gRPC ingress).
#[derive(Error, Debug)]
pub enum Serve {
    #[error("failed to bind admin HTTP listener on {1}")]
    AdminBind(#[source] std::io::Error, std::net::SocketAddr),

    #[error("failed to bind OTLP gRPC listener on {1}")]
    OtlpBind(#[source] tonic::transport::Error, std::net::SocketAddr),
}

/// Validation errors, surfaced verbatim to callers (see [`crate::timerange`]
/// and [`crate::sql_guard`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct Validation(pub String);

impl Validation {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
