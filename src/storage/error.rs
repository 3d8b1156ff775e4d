//! Storage Provider error taxonomy (C8 portion owned by C2).

use thiserror::Error;

/// Errors surfaced by [`super::Provider`] implementations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to {db_type} storage: {details}")]
    ConnectionFailure { db_type: &'static str, details: String },

    #[error("failed to run {db_type} schema migrations")]
    SchemaFailure {
        db_type: &'static str,
        #[source]
        cause: sqlx::migrate::MigrateError,
    },

    #[error("query failed: {operation}: {details}")]
    QueryFailure {
        operation: &'static str,
        details: String,
        #[source]
        cause: sqlx::Error,
    },

    #[error("no results")]
    NoResults,
}

impl Error {
    pub fn query(operation: &'static str, cause: sqlx::Error) -> Self {
        Self::QueryFailure {
            operation,
            details: cause.to_string(),
            cause,
        }
    }
}

/// Mirrors the source's `IsNoResults(err)` helper: single-row aggregate
/// endpoints translate this into a zero-valued result instead of an error.
pub fn is_no_results(err: &Error) -> bool {
    matches!(err, Error::NoResults)
        || matches!(err, Error::QueryFailure { cause, .. } if matches!(cause, sqlx::Error::RowNotFound))
}
