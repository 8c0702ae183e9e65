//! Error types for db-bridge.
//!
//! This module defines the closed error taxonomy surfaced to callers using `thiserror`.
//! Backend-native errors are mapped into these variants at the driver boundary so that
//! callers never have to match on `sqlx` or `mongodb` error types.

use crate::models::BackendKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Unsupported backend: {backend}")]
    UnsupportedBackend { backend: String },

    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        suggestion: String,
        /// False when the server refused the session outright, e.g. bad credentials.
        retryable: bool,
    },

    #[error("Timed out after {waited_ms}ms waiting for a {backend} connection")]
    PoolTimeout { backend: BackendKind, waited_ms: u64 },

    #[error("Connection pool for {backend} is closed")]
    PoolClosed { backend: BackendKind },

    #[error("Nested transactions are not supported: {message}")]
    TransactionNesting { message: String },

    #[error("Cannot normalize {backend} result: {message} (record {record}, field '{field}')")]
    ResultShape {
        backend: BackendKind,
        record: usize,
        field: String,
        message: String,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("{original}; rollback also failed (secondary): {rollback}")]
    RollbackFailed {
        original: Box<DbError>,
        rollback: Box<DbError>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an unsupported backend error.
    pub fn unsupported_backend(backend: impl Into<String>) -> Self {
        Self::UnsupportedBackend {
            backend: backend.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            retryable: true,
        }
    }

    /// Create a connection error that reopening cannot fix, such as rejected credentials.
    pub fn connection_rejected(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            retryable: false,
        }
    }

    /// Create a pool timeout error.
    pub fn pool_timeout(backend: BackendKind, waited_ms: u64) -> Self {
        Self::PoolTimeout { backend, waited_ms }
    }

    /// Create a pool closed error.
    pub fn pool_closed(backend: BackendKind) -> Self {
        Self::PoolClosed { backend }
    }

    /// Create a transaction nesting error.
    pub fn transaction_nesting(message: impl Into<String>) -> Self {
        Self::TransactionNesting {
            message: message.into(),
        }
    }

    /// Create a result shape error.
    pub fn result_shape(
        backend: BackendKind,
        record: usize,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ResultShape {
            backend,
            record,
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Combine a failed operation with the rollback that failed after it.
    pub fn rollback_failed(original: DbError, rollback: DbError) -> Self {
        Self::RollbackFailed {
            original: Box::new(original),
            rollback: Box::new(rollback),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolTimeout { .. } => {
                Some("Retry later or raise max_connections / queue_timeout_ms")
            }
            Self::RollbackFailed { original, .. } => original.suggestion(),
            _ => None,
        }
    }

    /// The error that caused a failed operation, skipping any secondary rollback failure.
    pub fn original(&self) -> &DbError {
        match self {
            Self::RollbackFailed { original, .. } => original.original(),
            other => other,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Check if this error leaves the backend session unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::Internal { .. } => true,
            Self::RollbackFailed { rollback, .. } => rollback.is_fatal(),
            _ => false,
        }
    }
}

/// Suggestion for a server-side failure, keyed on the SQLSTATE class.
fn sql_state_suggestion(code: Option<&str>) -> &'static str {
    match code.map(|c| c.get(..2).unwrap_or(c)) {
        Some("23") => "The statement violates a constraint; check keys and NOT NULL columns",
        Some("40") => "The transaction was aborted by the server; retry the whole block",
        Some("42") => "Check the statement syntax and that referenced tables and columns exist",
        Some("08") => "The server dropped the session; check connectivity and server logs",
        Some("28") => "Check the username and password",
        _ => "Inspect the server error message for details",
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;

        let transport = |what: &str, detail: String, hint: &str| {
            DbError::connection(format!("{what}: {detail}"), hint)
        };
        match err {
            E::Configuration(source) => DbError::config(source.to_string()),
            E::Database(server) => {
                let code = server.code().map(|c| c.into_owned());
                let suggestion = sql_state_suggestion(code.as_deref());
                DbError::database(server.message(), code, suggestion)
            }
            E::Io(source) => transport(
                "socket failure",
                source.to_string(),
                "Check that the server is reachable and accepting connections",
            ),
            E::Tls(source) => transport(
                "TLS handshake failed",
                source.to_string(),
                "Check tls_mode and the CA, certificate and key files",
            ),
            E::Protocol(detail) => transport(
                "wire protocol violation",
                detail,
                "Check that the server version is supported",
            ),
            E::PoolTimedOut | E::PoolClosed => {
                DbError::internal(format!("unexpected sqlx pool error: {err}"))
            }
            E::TypeNotFound { type_name } => {
                DbError::invalid_input(format!("unknown SQL type '{type_name}'"))
            }
            E::ColumnNotFound(column) => {
                DbError::invalid_input(format!("no column named '{column}' in the result"))
            }
            E::RowNotFound => DbError::database(
                "statement produced no row",
                None,
                "Use a read that tolerates empty results",
            ),
            E::ColumnIndexOutOfBounds { .. } | E::ColumnDecode { .. } | E::Decode(_) => {
                DbError::internal(format!("row decoding failed: {err}"))
            }
            other => DbError::internal(format!("driver failure: {other}")),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
