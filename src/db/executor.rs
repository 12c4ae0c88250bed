//! Read-only query execution.
//!
//! Two executors share one contract: run caller-supplied SQL text inside a
//! context the database itself enforces as read-only, and return every row.
//!
//! - [`PooledSessionExecutor`] checks a session out of the pool and declares
//!   the transaction read-only before running the query.
//! - [`DirectConnectionExecutor`] opens a fresh connection, sets the read-only
//!   session attribute, runs the query and closes the connection.
//!
//! On PostgreSQL the caller's text goes out as one unnamed extended-protocol
//! statement, so the server rejects payloads with several commands and
//! transaction control cannot be chained behind a query. On SQLite the text
//! runs as-is inside the transaction and the connection itself is opened
//! read-only.
//!
//! # Architecture
//!
//! The per-backend transaction runners live in the `postgres` and `sqlite`
//! submodules. The code structure is intentionally parallel to make
//! differences obvious.

use crate::db::pool::{ConnectionProvider, DirectConn, SessionConn};
use crate::db::types::decode_rows;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{ExecutorKind, ResultSet};
use sqlx::{Database, Transaction};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Runs one SQL text under read-only enforcement.
pub trait ReadOnlyExecutor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    fn execute(&self, sql: &str) -> impl Future<Output = GatewayResult<ResultSet>> + Send;
}

/// Executor backed by pooled sessions and read-only transactions.
#[derive(Debug, Clone)]
pub struct PooledSessionExecutor {
    provider: Arc<ConnectionProvider>,
    query_timeout: Duration,
}

impl PooledSessionExecutor {
    pub fn new(provider: Arc<ConnectionProvider>, query_timeout: Duration) -> Self {
        Self {
            provider,
            query_timeout,
        }
    }
}

impl ReadOnlyExecutor for PooledSessionExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Pooled
    }

    async fn execute(&self, sql: &str) -> GatewayResult<ResultSet> {
        let start = Instant::now();
        debug!(executor = %self.kind(), sql = %sql, "Executing query");

        let mut session = self.provider.acquire().await?;
        let query_timeout = self.query_timeout;

        let run = async {
            match session.connection() {
                SessionConn::Postgres(conn) => {
                    postgres::fetch_read_only(
                        conn,
                        sql,
                        Some(postgres::TRANSACTION_READ_ONLY),
                        query_timeout,
                    )
                    .await
                }
                SessionConn::SQLite(conn) => sqlite::fetch_read_only(conn, sql).await,
            }
        };
        let outcome = timeout(query_timeout, run).await;

        match outcome {
            Ok(result) => {
                self.provider.release(session);
                finish_logging(self.kind(), start, with_timeout_secs(result, query_timeout))
            }
            Err(_) => {
                self.provider.discard(session).await;
                Err(timeout_error(query_timeout))
            }
        }
    }
}

/// Executor that opens a dedicated connection per query.
#[derive(Debug, Clone)]
pub struct DirectConnectionExecutor {
    provider: Arc<ConnectionProvider>,
    query_timeout: Duration,
}

impl DirectConnectionExecutor {
    pub fn new(provider: Arc<ConnectionProvider>, query_timeout: Duration) -> Self {
        Self {
            provider,
            query_timeout,
        }
    }
}

impl ReadOnlyExecutor for DirectConnectionExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Direct
    }

    async fn execute(&self, sql: &str) -> GatewayResult<ResultSet> {
        let start = Instant::now();
        debug!(executor = %self.kind(), sql = %sql, "Executing query");

        let mut connection = self.provider.open_direct().await?;
        let query_timeout = self.query_timeout;

        let run = async {
            match connection.connection() {
                DirectConn::Postgres(conn) => {
                    postgres::configure_session(conn).await?;
                    postgres::fetch_read_only(conn, sql, None, query_timeout).await
                }
                DirectConn::SQLite(conn) => {
                    sqlite::configure_session(conn).await?;
                    sqlite::fetch_read_only(conn, sql).await
                }
            }
        };
        let outcome = timeout(query_timeout, run).await;

        // The connection is closed on every path, including timeouts.
        self.provider.close_direct(connection).await;

        match outcome {
            Ok(result) => finish_logging(self.kind(), start, with_timeout_secs(result, query_timeout)),
            Err(_) => Err(timeout_error(query_timeout)),
        }
    }
}

fn finish_logging(
    kind: ExecutorKind,
    start: Instant,
    result: GatewayResult<ResultSet>,
) -> GatewayResult<ResultSet> {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match &result {
        Ok(rows) => info!(executor = %kind, rows = rows.len(), elapsed_ms, "Query completed"),
        Err(e) => debug!(executor = %kind, elapsed_ms, error = %e, "Query failed"),
    }
    result
}

/// Server-side statement timeouts are reported without a duration; fill it in.
fn with_timeout_secs(
    result: GatewayResult<ResultSet>,
    query_timeout: Duration,
) -> GatewayResult<ResultSet> {
    result.map_err(|e| match e {
        GatewayError::Timeout { operation, .. } => {
            GatewayError::timeout(operation, query_timeout.as_secs())
        }
        other => other,
    })
}

fn timeout_error(query_timeout: Duration) -> GatewayError {
    GatewayError::timeout("query execution", query_timeout.as_secs())
}

/// Commit on success, roll back on failure.
async fn finish<DB: Database>(
    tx: Transaction<'_, DB>,
    result: GatewayResult<ResultSet>,
) -> GatewayResult<ResultSet> {
    match result {
        Ok(rows) => {
            tx.commit().await?;
            Ok(rows)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed after query error");
            }
            Err(e)
        }
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod postgres {
    use super::*;
    use sqlx::postgres::{PgConnection, PgRow};
    use sqlx::{Connection, Executor};

    pub const TRANSACTION_READ_ONLY: &str = "SET TRANSACTION READ ONLY";

    /// Make every subsequent transaction on this connection read-only.
    pub async fn configure_session(conn: &mut PgConnection) -> GatewayResult<()> {
        Executor::execute(&mut *conn, sqlx::raw_sql(crate::db::pool::PG_SESSION_READ_ONLY))
            .await?;
        Ok(())
    }

    pub async fn fetch_read_only(
        conn: &mut PgConnection,
        sql: &str,
        prelude: Option<&str>,
        statement_timeout: Duration,
    ) -> GatewayResult<ResultSet> {
        let mut tx = conn.begin().await?;
        let result = run(&mut tx, sql, prelude, statement_timeout).await;
        finish(tx, result).await
    }

    async fn run(
        conn: &mut PgConnection,
        sql: &str,
        prelude: Option<&str>,
        statement_timeout: Duration,
    ) -> GatewayResult<ResultSet> {
        if let Some(prelude) = prelude {
            Executor::execute(&mut *conn, sqlx::raw_sql(prelude)).await?;
        }
        let set_timeout = format!(
            "SET LOCAL statement_timeout = {}",
            statement_timeout.as_millis()
        );
        Executor::execute(&mut *conn, sqlx::raw_sql(&set_timeout)).await?;

        // Bound queries use the extended protocol: one command per message.
        let statement = sqlx::query::<sqlx::Postgres>(sql).persistent(false);
        let rows: Vec<PgRow> = Executor::fetch_all(&mut *conn, statement).await?;
        Ok(decode_rows(&rows))
    }
}

mod sqlite {
    use super::*;
    use futures_util::TryStreamExt;
    use sqlx::sqlite::{SqliteConnection, SqliteRow};
    use sqlx::{Connection, Executor};

    pub const QUERY_ONLY: &str = "PRAGMA query_only = ON";

    /// Reject writes for the rest of this connection's life.
    pub async fn configure_session(conn: &mut SqliteConnection) -> GatewayResult<()> {
        Executor::execute(&mut *conn, sqlx::raw_sql(QUERY_ONLY)).await?;
        Ok(())
    }

    pub async fn fetch_read_only(
        conn: &mut SqliteConnection,
        sql: &str,
    ) -> GatewayResult<ResultSet> {
        let mut tx = conn.begin().await?;
        let result = run(&mut tx, sql).await;
        finish(tx, result).await
    }

    async fn run(conn: &mut SqliteConnection, sql: &str) -> GatewayResult<ResultSet> {
        Executor::execute(&mut *conn, sqlx::raw_sql(QUERY_ONLY)).await?;
        let rows: Vec<SqliteRow> = Executor::fetch(&mut *conn, sqlx::raw_sql(sql))
            .try_collect()
            .await?;
        Ok(decode_rows(&rows))
    }
}
