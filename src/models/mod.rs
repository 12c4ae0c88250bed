//! Data models for the SQL query gateway.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::DatabaseType;
pub use query::{ExecutorKind, ResultSet, Row, SqlQueryParams, SqlValue};
