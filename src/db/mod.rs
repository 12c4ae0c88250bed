//! Database access layer.
//!
//! This module provides:
//! - Connection management (pooled sessions and direct connections)
//! - Read-only query execution
//! - Row decoding into typed values

pub mod executor;
pub mod pool;
pub mod types;

pub use executor::{DirectConnectionExecutor, PooledSessionExecutor, ReadOnlyExecutor};
pub use pool::{ConnectionProvider, DbPool, ProviderSnapshot};
