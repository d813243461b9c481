//! Integration tests for adapter caching and replica failover.

use std::sync::Arc;
use tempfile::TempDir;
use unidb::models::{ConnectionConfig, DatabaseConfig, DatabaseType};
use unidb::{AdapterFactory, DbError};

fn sqlite(dir: &TempDir, file: &str) -> ConnectionConfig {
    ConnectionConfig::sqlite(dir.path().join(file).to_string_lossy()).with_timeout_secs(2)
}

/// An endpoint SQLite cannot open: its parent directory does not exist.
fn unreachable(dir: &TempDir) -> ConnectionConfig {
    ConnectionConfig::sqlite(dir.path().join("missing").join("primary.db").to_string_lossy())
        .with_timeout_secs(2)
}

#[tokio::test]
async fn test_failover_to_replica() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig::single("main", DatabaseType::SQLite, unreachable(&dir))
        .with_replica(unreachable(&dir))
        .with_replica(sqlite(&dir, "replica.db"));
    let factory = AdapterFactory::with_configs([config]).unwrap();

    // Without failover the primary error surfaces
    let err = factory.create_adapter("main").await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));
    assert_eq!(factory.cached_count().await, 0);

    let adapter = factory.create_adapter_with_failover("main").await.unwrap();
    assert!(adapter.health_check().await);
    assert!(adapter.config().database.ends_with("replica.db"));

    // The replica is now the cached adapter for the name
    let again = factory.create_adapter("main").await.unwrap();
    assert!(Arc::ptr_eq(&adapter, &again));
    assert_eq!(
        factory.health_check_all().await.get("main").copied(),
        Some(true)
    );
}

#[tokio::test]
async fn test_failover_returns_primary_error_when_all_fail() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig::single("main", DatabaseType::SQLite, unreachable(&dir))
        .with_replica(unreachable(&dir));
    let factory = AdapterFactory::with_configs([config]).unwrap();

    let err = factory
        .create_adapter_with_failover("main")
        .await
        .unwrap_err();
    match err {
        DbError::Connection { message, .. } => assert!(message.contains("Failed to connect")),
        other => panic!("expected a connection error, got {other:?}"),
    }
    assert!(factory.get_adapter("main").await.is_none());
}

#[tokio::test]
async fn test_health_and_metrics_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let factory = AdapterFactory::with_configs([
        DatabaseConfig::single("a", DatabaseType::SQLite, sqlite(&dir, "a.db")),
        DatabaseConfig::single("b", DatabaseType::SQLite, sqlite(&dir, "b.db")),
    ])
    .unwrap();

    assert!(factory.health_check_all().await.is_empty());

    let a = factory.create_adapter("a").await.unwrap();
    factory.create_adapter("b").await.unwrap();
    a.query("SELECT 1", &[]).await.unwrap();

    let health = factory.health_check_all().await;
    assert_eq!(health.len(), 2);
    assert!(health.values().all(|h| *h));

    let metrics = factory.get_metrics_all().await;
    assert!(metrics["a"].query_count > metrics["b"].query_count);

    // A closed adapter drops out of the cache and the fan-out
    assert!(factory.close_adapter("a").await.unwrap());
    assert!(!factory.close_adapter("a").await.unwrap());
    assert!(!a.is_connected().await);
    assert_eq!(factory.health_check_all().await.len(), 1);

    factory.close_all_adapters().await;
    assert_eq!(factory.cached_count().await, 0);
}

#[tokio::test]
async fn test_register_replaces_cached_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let factory = AdapterFactory::new();
    factory
        .register(DatabaseConfig::single(
            "main",
            DatabaseType::SQLite,
            sqlite(&dir, "first.db"),
        ))
        .await
        .unwrap();
    let first = factory.create_adapter("main").await.unwrap();

    factory
        .register(DatabaseConfig::single(
            "main",
            DatabaseType::SQLite,
            sqlite(&dir, "second.db"),
        ))
        .await
        .unwrap();
    assert!(!first.is_connected().await);

    let second = factory.create_adapter("main").await.unwrap();
    assert!(second.config().database.ends_with("second.db"));
    assert_eq!(factory.names().await, vec!["main".to_string()]);
}
