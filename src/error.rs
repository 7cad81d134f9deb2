use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Failures raised by a record store and the streams it produces.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported database driver '{0}'")]
    UnsupportedDriver(String),
    #[error("failed to open {driver} store: {source}")]
    Connection {
        driver: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{query} query failed: {source}")]
    Query {
        query: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{query} iteration failed: {source}")]
    Iteration {
        query: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to decode {record} row: {source}")]
    Decode {
        record: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("migration error: {0}")]
    Migration(#[from] MigrateError),
}

impl StoreError {
    pub fn query(query: impl Into<String>, source: sqlx::Error) -> Self {
        StoreError::Query {
            query: query.into(),
            source,
        }
    }

    pub fn iteration(query: impl Into<String>, source: sqlx::Error) -> Self {
        StoreError::Iteration {
            query: query.into(),
            source,
        }
    }

    pub fn decode(record: &'static str, source: sqlx::Error) -> Self {
        StoreError::Decode { record, source }
    }

    /// Whether the error makes the store unusable rather than one query or row.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            StoreError::Connection { .. } | StoreError::UnsupportedDriver(_)
        )
    }
}

/// Fatal failures of a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to fetch mailboxes: {0}")]
    MailboxFetch(#[source] StoreError),
}
