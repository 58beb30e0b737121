//! Error types for the reconciliation ETL
//!
//! Row-level data problems are never errors here: they are collected into the
//! [`ValidationReport`](crate::validation::ValidationReport). Everything in this
//! module aborts the stage that raised it.

use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    /// Input is missing required columns; no row was evaluated
    #[error("Missing required columns: {}", .missing.join(", "))]
    SchemaStructure { missing: Vec<String> },

    /// Datastore unreachable or the connection was lost
    #[error("Database connection failed: {0}. Check DATABASE_URL and that the server is reachable.")]
    Connection(String),

    /// The batch could not be committed; the transaction was rolled back
    #[error("Load failed ({rows_failed} rows rolled back): {message}")]
    Load { message: String, rows_failed: usize },

    #[error("Unknown deduplication strategy '{0}'. Expected one of: hash, key, priority, merge.")]
    UnknownStrategy(String),

    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("Invalid reducer '{reducer}' for column '{column}'")]
    InvalidReducer { column: String, reducer: String },

    /// Reading the raw batch failed (I/O, malformed CSV)
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// Run metrics could not be persisted or read back
    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Configuration error: {0}. Check your environment variables or .env file.")]
    Config(String),

    /// A run tried to move between states out of order
    #[error("Illegal run transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

impl EtlError {
    pub fn schema_structure(missing: Vec<String>) -> Self {
        Self::SchemaStructure { missing }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn load(message: impl Into<String>, rows_failed: usize) -> Self {
        Self::Load {
            message: message.into(),
            rows_failed,
        }
    }

    pub fn invalid_reducer(column: impl Into<String>, reducer: impl Into<String>) -> Self {
        Self::InvalidReducer {
            column: column.into(),
            reducer: reducer.into(),
        }
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction(message.into())
    }

    pub fn metrics(message: impl Into<String>) -> Self {
        Self::Metrics(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True when the failure came from the datastore being unavailable
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Re-tag a failure raised inside a batch so it carries the batch size.
    ///
    /// Connection failures stay connection failures.
    pub fn into_batch_failure(self, rows_failed: usize) -> Self {
        match self {
            Self::Connection(_) => self,
            Self::Load { message, .. } => Self::load(message, rows_failed),
            other => Self::load(other.to_string(), rows_failed),
        }
    }
}

impl From<sqlx::Error> for EtlError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            other => Self::load(other.to_string(), 0),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for EtlError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Connection(format!("schema migration failed: {err}"))
    }
}

impl From<csv::Error> for EtlError {
    fn from(err: csv::Error) -> Self {
        Self::Extraction(err.to_string())
    }
}
