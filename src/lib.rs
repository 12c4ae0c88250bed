//! SQL Query Gateway Library
//!
//! An HTTP gateway that authenticates callers, rate limits them and runs
//! their SQL against PostgreSQL or SQLite strictly in read-only mode.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gate;
pub mod models;
pub mod rate_limit;
pub mod sql_validator;
pub mod transport;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
