//! Optional static read-only pre-check.
//!
//! When enabled, SQL text is parsed with the engine's dialect before it
//! reaches the database and anything other than a plain query is rejected.
//! The database still enforces read-only mode regardless; this only fails
//! obvious writes earlier and without a round trip.

use crate::error::{GatewayError, GatewayResult};
use crate::models::DatabaseType;
use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use tracing::debug;

/// Get the appropriate SQL dialect for the given database type.
fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Validate that every statement in `sql` is a read-only query.
///
/// ```
/// use sql_query_gateway::models::DatabaseType;
/// use sql_query_gateway::sql_validator::validate_readonly;
///
/// assert!(validate_readonly("SELECT * FROM users", DatabaseType::PostgreSQL).is_ok());
/// assert!(validate_readonly("DELETE FROM users", DatabaseType::PostgreSQL).is_err());
/// ```
pub fn validate_readonly(sql: &str, db_type: DatabaseType) -> GatewayResult<()> {
    let dialect = get_dialect(db_type);

    let statements = Parser::parse_sql(dialect.as_ref(), sql)
        .map_err(|e| GatewayError::query(format!("Failed to parse SQL: {}", e), None))?;

    if statements.is_empty() {
        return Err(GatewayError::invalid_input("Empty SQL statement"));
    }

    for stmt in &statements {
        if !is_read_only(stmt) {
            let keyword = statement_keyword(stmt);
            debug!(statement = %keyword, "Pre-check rejected statement");
            return Err(GatewayError::read_only(
                format!("{} rejected by pre-check", keyword),
                None,
            ));
        }
    }

    Ok(())
}

/// Plain queries without row locks, and EXPLAIN of such queries.
fn is_read_only(stmt: &Statement) -> bool {
    match stmt {
        Statement::Query(query) => query.locks.is_empty(),
        Statement::Explain {
            statement,
            analyze,
            ..
        } => !*analyze && is_read_only(statement),
        _ => false,
    }
}

/// Leading keyword of a statement, for log lines.
fn statement_keyword(stmt: &Statement) -> String {
    stmt.to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}
