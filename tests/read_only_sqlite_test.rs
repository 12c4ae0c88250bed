//! Integration tests for read-only execution against SQLite.
//!
//! Tests verify that:
//! - Both executors return rows for plain queries
//! - Writes are rejected and leave the database unchanged
//! - Multi-statement payloads fail as a whole
//! - Held connections return to baseline after success, error and timeout

use serde_json::json;
use sql_query_gateway::config::DatabaseConfig;
use sql_query_gateway::db::{
    ConnectionProvider, DirectConnectionExecutor, PooledSessionExecutor, ReadOnlyExecutor,
};
use sql_query_gateway::error::GatewayError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Create a SQLite database file with fixture data and return its URL.
async fn setup_fixture_db() -> String {
    let temp_file = NamedTempFile::new().unwrap();
    // Keep the temp file alive - prevent deletion when function returns
    let db_path = temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let url = format!("sqlite:{}", db_path);

    let options = SqliteConnectOptions::from_str(&url)
        .unwrap()
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete);
    let writer = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();

    sqlx::raw_sql(
        "CREATE TABLE products (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            price REAL,
            qty INTEGER,
            added DATE,
            note TEXT
        );
        INSERT INTO products VALUES (1, 'widget', 2.5, 10, '2024-01-15', 'first');
        INSERT INTO products VALUES (2, 'gadget', 10.0, 0, '2024-02-29', NULL);
        INSERT INTO products VALUES (3, 'gizmo', 0.75, 250, '2023-12-31', 'último');",
    )
    .execute(&writer)
    .await
    .unwrap();
    writer.close().await;

    url
}

async fn setup_provider() -> Arc<ConnectionProvider> {
    let url = setup_fixture_db().await;
    let config = DatabaseConfig::parse(&url).unwrap();
    Arc::new(
        ConnectionProvider::connect(&config, Duration::from_secs(5))
            .await
            .unwrap(),
    )
}

fn executors(
    provider: &Arc<ConnectionProvider>,
    query_timeout: Duration,
) -> (PooledSessionExecutor, DirectConnectionExecutor) {
    (
        PooledSessionExecutor::new(provider.clone(), query_timeout),
        DirectConnectionExecutor::new(provider.clone(), query_timeout),
    )
}

async fn product_count<E: ReadOnlyExecutor>(executor: &E) -> serde_json::Value {
    let rows = executor
        .execute("SELECT COUNT(*) AS n FROM products")
        .await
        .unwrap();
    serde_json::to_value(rows).unwrap()
}

#[tokio::test]
async fn test_select_one_both_executors() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_secs(10));

    let a = pooled.execute("SELECT 1 AS one").await.unwrap();
    let b = direct.execute("SELECT 1 AS one").await.unwrap();

    assert_eq!(serde_json::to_value(&a).unwrap(), json!([{"one": 1}]));
    assert_eq!(serde_json::to_value(&b).unwrap(), json!([{"one": 1}]));
}

#[tokio::test]
async fn test_empty_result_is_empty_array() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_secs(10));

    for rows in [
        pooled
            .execute("SELECT * FROM products WHERE id < 0")
            .await
            .unwrap(),
        direct
            .execute("SELECT * FROM products WHERE id < 0")
            .await
            .unwrap(),
    ] {
        assert!(rows.is_empty());
        assert_eq!(serde_json::to_string(&rows).unwrap(), "[]");
    }
}

#[tokio::test]
async fn test_writes_rejected_and_database_unchanged() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_secs(10));
    let before = product_count(&pooled).await;

    let writes = [
        "INSERT INTO products (id, name) VALUES (99, 'evil')",
        "UPDATE products SET price = 0",
        "DELETE FROM products",
        "CREATE TABLE evil (x INTEGER)",
        "DROP TABLE products",
        "ALTER TABLE products ADD COLUMN evil TEXT",
    ];

    for sql in writes {
        let pooled_err = pooled.execute(sql).await.unwrap_err();
        assert!(
            matches!(pooled_err, GatewayError::ReadOnlyViolation { .. }),
            "pooled executor should reject {}: {:?}",
            sql,
            pooled_err
        );

        let direct_err = direct.execute(sql).await.unwrap_err();
        assert!(
            matches!(direct_err, GatewayError::ReadOnlyViolation { .. }),
            "direct executor should reject {}: {:?}",
            sql,
            direct_err
        );
    }

    assert_eq!(product_count(&pooled).await, before);
    assert_eq!(product_count(&direct).await, before);
    assert_eq!(before, json!([{"n": 3}]));
}

#[tokio::test]
async fn test_multi_statement_fails_as_whole() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_secs(10));

    let sql = "SELECT 1; CREATE TABLE evil (x INTEGER)";
    assert!(pooled.execute(sql).await.is_err());
    assert!(direct.execute(sql).await.is_err());

    let tables = pooled
        .execute("SELECT name FROM sqlite_master WHERE name = 'evil'")
        .await
        .unwrap();
    assert!(tables.is_empty());
}

#[tokio::test]
async fn test_select_for_update_is_syntax_error_on_sqlite() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_secs(10));

    let sql = "SELECT * FROM products FOR UPDATE";
    assert!(matches!(
        pooled.execute(sql).await,
        Err(GatewayError::QuerySyntax { .. })
    ));
    assert!(matches!(
        direct.execute(sql).await,
        Err(GatewayError::QuerySyntax { .. })
    ));
}

#[tokio::test]
async fn test_syntax_error_carries_driver_message() {
    let provider = setup_provider().await;
    let (pooled, _) = executors(&provider, Duration::from_secs(10));

    let err = pooled.execute("SELEC 1").await.unwrap_err();
    assert!(matches!(err, GatewayError::QuerySyntax { .. }));
    assert!(err.public_message().contains("SELEC"));
}

#[tokio::test]
async fn test_repeated_count_is_idempotent() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_secs(10));

    let first = product_count(&pooled).await;
    for _ in 0..5 {
        assert_eq!(product_count(&pooled).await, first);
        assert_eq!(product_count(&direct).await, first);
    }
}

#[tokio::test]
async fn test_value_round_trip() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_secs(10));

    let sql = "SELECT id, name, price, qty, added, note FROM products ORDER BY id";
    let expected = json!([
        {"id": 1, "name": "widget", "price": 2.5, "qty": 10, "added": "2024-01-15", "note": "first"},
        {"id": 2, "name": "gadget", "price": 10.0, "qty": 0, "added": "2024-02-29", "note": null},
        {"id": 3, "name": "gizmo", "price": 0.75, "qty": 250, "added": "2023-12-31", "note": "último"}
    ]);

    let a = serde_json::to_value(pooled.execute(sql).await.unwrap()).unwrap();
    let b = serde_json::to_value(direct.execute(sql).await.unwrap()).unwrap();
    assert_eq!(a, expected);
    assert_eq!(b, expected);
}

#[tokio::test]
async fn test_column_order_preserved() {
    let provider = setup_provider().await;
    let (pooled, _) = executors(&provider, Duration::from_secs(10));

    let rows = pooled
        .execute("SELECT note, qty, name, id FROM products WHERE id = 1")
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_string(&rows).unwrap(),
        r#"[{"note":"first","qty":10,"name":"widget","id":1}]"#
    );
}

#[tokio::test]
async fn test_held_connections_return_to_baseline() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_secs(10));
    assert_eq!(provider.stats().held, 0);

    pooled.execute("SELECT 1").await.unwrap();
    direct.execute("SELECT 1").await.unwrap();
    assert_eq!(provider.stats().held, 0);

    pooled.execute("DELETE FROM products").await.unwrap_err();
    direct.execute("not even sql").await.unwrap_err();
    assert_eq!(provider.stats().held, 0);

    assert_eq!(provider.stats().acquisitions, 4);
}

#[tokio::test]
async fn test_concurrent_queries_release_all_connections() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_secs(10));
    let pooled = Arc::new(pooled);
    let direct = Arc::new(direct);

    let mut handles = Vec::new();
    for i in 0..16 {
        let pooled = pooled.clone();
        let direct = direct.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                pooled.execute("SELECT COUNT(*) FROM products").await
            } else {
                direct.execute("SELECT COUNT(*) FROM products").await
            }
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 1);
    }

    assert_eq!(provider.stats().held, 0);
    assert_eq!(provider.stats().acquisitions, 16);
}

#[tokio::test]
async fn test_timeout_releases_connection() {
    let provider = setup_provider().await;
    let (pooled, direct) = executors(&provider, Duration::from_millis(20));

    // Bounded but slow: counts ten million generated rows
    let slow = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 10000000) \
                SELECT COUNT(*) FROM c";

    let err = pooled.execute(slow).await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }), "{:?}", err);
    assert_eq!(provider.stats().held, 0);

    let err = direct.execute(slow).await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }), "{:?}", err);
    assert_eq!(provider.stats().held, 0);

    // The pool still serves queries afterwards
    let (pooled, _) = executors(&provider, Duration::from_secs(30));
    assert_eq!(pooled.execute("SELECT 1").await.unwrap().len(), 1);
}
