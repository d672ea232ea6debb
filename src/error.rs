//! Error types for the SQL Sink Connector
//!
//! Two layers:
//! - `SinkError`: failures reported by a sink backend (connection, query, transaction)
//! - `LoaderError`: what the loader surfaces to the pipeline, always tagged with the
//!   partition it happened in so the caller can decide between abort, skip and retry

use crate::record::Row;
use thiserror::Error;

/// Result type for loader operations
pub type LoaderResult<T> = std::result::Result<T, LoaderError>;

/// Result type for sink backend operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Errors raised by a sink backend
#[derive(Error, Debug)]
pub enum SinkError {
    /// Could not reach the database, or the connection went away
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement preparation or execution failed
    #[error("query error: {message}")]
    Query { message: String, sql: Option<String> },

    /// BEGIN / COMMIT / ROLLBACK failed
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// No connection profile with this name is configured
    #[error("unknown sink profile '{profile}'")]
    UnknownProfile { profile: String },

    /// A row did not line up with the partition's column list
    #[error("column mismatch: expected {expected:?}, got {actual:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// Operation or value not supported by this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },
}

impl SinkError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
        }
    }

    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// SQL text attached to the error, if any
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Query { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}

/// Errors surfaced by the loader to the pipeline
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Invalid configuration or unknown sink profile; raised before any row is written
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The insert statement could not be prepared for a partition
    #[error("statement error in partition '{partition}': {source}")]
    Statement {
        partition: String,
        #[source]
        source: SinkError,
    },

    /// A row failed to execute; the open window is left uncommitted
    #[error("write error in partition '{partition}': {source}")]
    Write {
        partition: String,
        row: Box<Row>,
        #[source]
        source: SinkError,
    },

    /// A window failed to commit; `uncommitted` rows were not persisted
    #[error("commit error in partition '{partition}' ({uncommitted} rows not persisted): {source}")]
    Commit {
        partition: String,
        uncommitted: usize,
        #[source]
        source: SinkError,
    },

    /// The handler was aborted and accepts no more rows
    #[error("loader was aborted")]
    Aborted,

    /// BEGIN or ROLLBACK failed, or the window is unusable after a failed commit
    #[error("transaction error in partition '{partition}': {source}")]
    Transaction {
        partition: String,
        #[source]
        source: SinkError,
    },
}

impl LoaderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Partition the error belongs to; configuration errors have none
    pub fn partition(&self) -> Option<&str> {
        match self {
            Self::Configuration(_) | Self::Aborted => None,
            Self::Statement { partition, .. }
            | Self::Write { partition, .. }
            | Self::Commit { partition, .. }
            | Self::Transaction { partition, .. } => Some(partition),
        }
    }

    /// The row that failed, for write errors
    pub fn failed_row(&self) -> Option<&Row> {
        match self {
            Self::Write { row, .. } => Some(row),
            _ => None,
        }
    }
}
