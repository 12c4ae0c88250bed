//! Error types for the SQL query gateway.
//!
//! This module defines the gateway error taxonomy using `thiserror`, the
//! classification of driver failures into that taxonomy, and the mapping of
//! each error kind to an HTTP status and a caller-visible message.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::error::DatabaseError;
use sqlx::postgres::PgDatabaseError;
use sqlx::sqlite::SqliteError;
use thiserror::Error;
use tracing::{error, warn};

/// Message returned for write attempts. Never includes engine text.
const READ_ONLY_MESSAGE: &str =
    "Write operations are not permitted: queries run in a read-only transaction";

/// Message returned when the rate limit is exceeded.
const RATE_LIMITED_MESSAGE: &str =
    "Rate limit exceeded. Please try again later or contact your administrator.";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid API key")]
    Unauthorized,

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Read-only violation: {message}")]
    ReadOnlyViolation {
        /// Engine message, kept for logs only
        message: String,
        sql_state: Option<String>,
    },

    #[error("Query error: {message}")]
    QuerySyntax {
        message: String,
        /// e.g., "42601" for a syntax error
        sql_state: Option<String>,
    },

    #[error("Connection failed: {message}")]
    Connectivity { message: String, suggestion: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a rate limit error with a retry hint.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimited { retry_after_secs }
    }

    /// Create a read-only violation error.
    pub fn read_only(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::ReadOnlyViolation {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a query error carrying the driver-reported message.
    pub fn query(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::QuerySyntax {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a connectivity error with a helpful suggestion for the logs.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ReadOnlyViolation { .. } | Self::QuerySyntax { .. } | Self::InvalidInput { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Connectivity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::ReadOnlyViolation { .. } => "read_only_violation",
            Self::QuerySyntax { .. } => "query_error",
            Self::Connectivity { .. } => "service_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// The message shown to the caller.
    ///
    /// Read-only violations, connectivity failures, timeouts and internal
    /// errors never expose engine or driver detail.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthorized => "Invalid API key".to_string(),
            Self::RateLimited { .. } => RATE_LIMITED_MESSAGE.to_string(),
            Self::ReadOnlyViolation { .. } => READ_ONLY_MESSAGE.to_string(),
            Self::QuerySyntax { message, sql_state } => match sql_state {
                Some(code) => format!("{} (SQLSTATE: {})", message, code),
                None => message.clone(),
            },
            Self::Connectivity { .. } => "Database temporarily unavailable".to_string(),
            Self::Timeout { elapsed_secs, .. } => {
                format!("Query exceeded the {}s time limit", elapsed_secs)
            }
            Self::InvalidInput { message } => message.clone(),
            Self::Internal { .. } => "Internal server error".to_string(),
        }
    }

    /// Seconds the caller should wait before retrying, if applicable.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connectivity { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connectivity { .. } | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }
}

/// Convert sqlx errors to GatewayError.
impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => classify_database_error(db_err.as_ref()),
            sqlx::Error::Configuration(msg) => GatewayError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::PoolTimedOut => GatewayError::connection(
                "Timed out waiting for a pooled connection",
                "The pool is exhausted; raise max_connections or acquire_timeout",
            ),
            sqlx::Error::PoolClosed => {
                GatewayError::connection("Connection pool is closed", "Restart the gateway")
            }
            sqlx::Error::Io(io_err) => GatewayError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => GatewayError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => GatewayError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                GatewayError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                GatewayError::internal(format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => GatewayError::internal("Database worker crashed"),
            other => GatewayError::internal(format!("Unknown database error: {}", other)),
        }
    }
}

/// Classify an error reported by the database engine itself.
fn classify_database_error(db_err: &dyn DatabaseError) -> GatewayError {
    if let Some(pg) = db_err.try_downcast_ref::<PgDatabaseError>() {
        return classify_sql_state(pg.code(), pg.message());
    }
    if db_err.try_downcast_ref::<SqliteError>().is_some() {
        let code = db_err.code().and_then(|c| c.parse::<i32>().ok());
        return classify_sqlite_code(code, db_err.message());
    }
    GatewayError::query(db_err.message(), db_err.code().map(|c| c.to_string()))
}

/// Classify a PostgreSQL SQLSTATE.
pub(crate) fn classify_sql_state(code: &str, message: &str) -> GatewayError {
    let sql_state = Some(code.to_string());
    match code {
        // read_only_sql_transaction
        "25006" => GatewayError::read_only(message, sql_state),
        // query_canceled, raised when statement_timeout fires
        "57014" => GatewayError::timeout("query execution", 0),
        c if c.starts_with("08") || c.starts_with("53") || c.starts_with("57P") => {
            GatewayError::connection(
                format!("{} (SQLSTATE: {})", message, code),
                "Check database server status",
            )
        }
        _ => GatewayError::query(message, sql_state),
    }
}

/// Classify an SQLite result code (primary or extended).
pub(crate) fn classify_sqlite_code(code: Option<i32>, message: &str) -> GatewayError {
    let sql_state = code.map(|c| c.to_string());
    // Extended codes carry the primary code in the low byte.
    match code.map(|c| c & 0xff) {
        // SQLITE_READONLY
        Some(8) => GatewayError::read_only(message, sql_state),
        // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN
        Some(5) | Some(6) | Some(14) => GatewayError::connection(
            message.to_string(),
            "The database file is locked or unavailable",
        ),
        _ => GatewayError::query(message, sql_state),
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(
                code = self.code(),
                error = %self,
                suggestion = ?self.suggestion(),
                "Request failed"
            );
        } else {
            warn!(code = self.code(), error = %self, "Request rejected");
        }

        let retry_after = self.retry_after_secs();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.public_message(),
                retry_after_secs: retry_after,
            },
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
