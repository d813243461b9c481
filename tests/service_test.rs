//! Integration tests for the unified service over single and sharded
//! SQLite databases.

use serde_json::{Value as JsonValue, json};
use tempfile::TempDir;
use unidb::models::{
    ConnectionConfig, DatabaseConfig, DatabaseKind, DatabaseType, IndexDefinition, PageRequest,
    Row, RowUpdate, ShardingSpec, SortDirection,
};
use unidb::{DbError, UnifiedDatabaseService};

const ORDERS_DDL: &str = "CREATE TABLE orders (
    id INTEGER PRIMARY KEY,
    customer TEXT NOT NULL,
    total REAL
)";

const METRICS_DDL: &str = "CREATE TABLE metrics (
    id INTEGER PRIMARY KEY,
    server_id TEXT NOT NULL,
    cpu REAL,
    created_at TEXT
)";

fn row(value: JsonValue) -> Row {
    value.as_object().cloned().unwrap()
}

fn sqlite(dir: &TempDir, file: &str) -> ConnectionConfig {
    ConnectionConfig::sqlite(dir.path().join(file).to_string_lossy()).with_timeout_secs(2)
}

fn sharded(dir: &TempDir, name: &str, shards: usize, replication_factor: usize) -> DatabaseConfig {
    let spec = (1..=shards).fold(ShardingSpec::new("server_id"), |spec, i| {
        spec.with_shard(format!("s{i}"), sqlite(dir, &format!("{name}-{i}.db")))
    });
    DatabaseConfig::sharded(
        name,
        DatabaseType::SQLite,
        spec.with_replication_factor(replication_factor),
    )
}

async fn setup(dir: &TempDir) -> UnifiedDatabaseService {
    let service = UnifiedDatabaseService::from_configs([
        DatabaseConfig::single("main", DatabaseType::SQLite, sqlite(dir, "main.db")),
        sharded(dir, "metrics", 3, 1),
    ])
    .unwrap();
    service.initialize().await.unwrap();
    service.execute("main", ORDERS_DDL, &[]).await.unwrap();
    service.execute("metrics", METRICS_DDL, &[]).await.unwrap();
    service
}

fn sample(id: i64) -> Row {
    row(json!({
        "id": id,
        "server_id": format!("srv-{}", id % 5),
        "cpu": 0.5,
        "created_at": format!("2024-01-01T00:00:{:02}", id),
    }))
}

#[tokio::test]
async fn test_unknown_database_lists_configured_names() {
    let dir = tempfile::tempdir().unwrap();
    let service = setup(&dir).await;

    let err = service.query("nope", "SELECT 1", &[]).await.unwrap_err();
    match err {
        DbError::DatabaseNotFound { database, hint } => {
            assert_eq!(database, "nope");
            assert!(hint.contains("main"));
            assert!(hint.contains("metrics"));
        }
        other => panic!("expected DatabaseNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_database_crud() {
    let dir = tempfile::tempdir().unwrap();
    let service = setup(&dir).await;

    service
        .insert("main", "orders", &row(json!({"id": 1, "customer": "acme", "total": 10.0})))
        .await
        .unwrap();
    let found = service
        .find_by_id("main", "orders", &json!(1), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["customer"], json!("acme"));

    let changed = service
        .update("main", "orders", &json!(1), &row(json!({"total": 12.5})), None)
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let updates = vec![RowUpdate::new(1, row(json!({"customer": "globex"})))];
    assert_eq!(service.bulk_update("main", "orders", &updates).await.unwrap(), 1);
    let rows = service
        .find_by_field("main", "orders", "customer", &json!("globex"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["total"], json!(12.5));

    assert_eq!(service.delete("main", "orders", &json!(1), None).await.unwrap(), 1);
    assert!(service.table_exists("main", "orders").await.unwrap());
    let schema = service.get_table_schema("main", "orders").await.unwrap();
    assert_eq!(schema.columns.len(), 3);
}

#[tokio::test]
async fn test_execute_transaction_commits_on_ok() {
    let dir = tempfile::tempdir().unwrap();
    let service = setup(&dir).await;

    let order = row(json!({"id": 7, "customer": "acme", "total": 3.0}));
    let stored = service
        .execute_transaction("main", |tx| {
            Box::pin(async move {
                let stored = tx.insert("orders", &order).await?;
                tx.update("orders", &json!(7), &row(json!({"total": 4.0})))
                    .await?;
                Ok::<_, DbError>(stored)
            })
        })
        .await
        .unwrap();
    assert_eq!(stored["customer"], json!("acme"));

    let found = service
        .find_by_id("main", "orders", &json!(7), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["total"], json!(4.0));
}

#[tokio::test]
async fn test_execute_transaction_rolls_back_on_err() {
    let dir = tempfile::tempdir().unwrap();
    let service = setup(&dir).await;

    let order = row(json!({"id": 8, "customer": "acme", "total": 3.0}));
    let err = service
        .execute_transaction("main", |tx| {
            Box::pin(async move {
                tx.insert("orders", &order).await?;
                // Duplicate primary key fails inside the transaction
                tx.insert("orders", &order).await?;
                Ok::<_, DbError>(())
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Query { .. }));
    assert!(service
        .find_by_id("main", "orders", &json!(8), None)
        .await
        .unwrap()
        .is_none());

    // The work may also abort on its own terms
    let order = row(json!({"id": 9, "customer": "acme", "total": 1.0}));
    let err = service
        .execute_transaction("main", |tx| {
            Box::pin(async move {
                tx.insert("orders", &order).await?;
                Err::<(), _>(DbError::invalid_input("credit limit exceeded"))
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert!(service
        .find_by_id("main", "orders", &json!(9), None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_sharded_transactions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let service = setup(&dir).await;

    let err = service.begin_transaction("metrics").await.unwrap_err();
    assert!(matches!(err, DbError::UnsupportedOperation { .. }));

    let err = service
        .execute_transaction("metrics", |_tx| Box::pin(async move { Ok::<_, DbError>(()) }))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UnsupportedOperation { .. }));

    let updates = vec![RowUpdate::new(1, row(json!({"cpu": 1.0})))];
    let err = service
        .bulk_update("metrics", "metrics", &updates)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UnsupportedOperation { .. }));
}

#[tokio::test]
async fn test_sharded_paginate_merges_shards() {
    let dir = tempfile::tempdir().unwrap();
    let service = setup(&dir).await;

    let records: Vec<Row> = (1..=25).map(sample).collect();
    assert_eq!(
        service.bulk_insert("metrics", "metrics", &records).await.unwrap(),
        25
    );

    let request = PageRequest::new(2, 10).order_by("id", SortDirection::Asc);
    let page = service.paginate("metrics", "metrics", &request).await.unwrap();
    assert_eq!(page.total, 25);
    assert_eq!(page.total_pages, 3);
    let ids: Vec<_> = page.data.iter().map(|r| r["id"].clone()).collect();
    let expected: Vec<_> = (11..=20).map(|i| json!(i)).collect();
    assert_eq!(ids, expected);

    // Default ordering: created_at descending
    let first = service
        .paginate("metrics", "metrics", &PageRequest::new(1, 3))
        .await
        .unwrap();
    let ids: Vec<_> = first.data.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(25), json!(24), json!(23)]);

    let filtered = service
        .paginate(
            "metrics",
            "metrics",
            &PageRequest::new(1, 10).filter("server_id", "srv-1"),
        )
        .await
        .unwrap();
    assert_eq!(filtered.total, 5);
    assert!(filtered.data.iter().all(|r| r["server_id"] == json!("srv-1")));

    // The merge window page * limit must stay a valid LIMIT
    let err = service
        .paginate("metrics", "metrics", &PageRequest::new(u64::MAX / 2, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn test_replicated_paginate_counts_logical_rows() {
    let dir = tempfile::tempdir().unwrap();
    let service = UnifiedDatabaseService::from_configs([sharded(&dir, "events", 3, 2)]).unwrap();
    service.execute("events", METRICS_DDL, &[]).await.unwrap();
    let records: Vec<Row> = (1..=5).map(sample).collect();
    service.bulk_insert("events", "metrics", &records).await.unwrap();

    let request = PageRequest::new(1, 10).order_by("id", SortDirection::Asc);
    let page = service.paginate("events", "metrics", &request).await.unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages, 1);
    let ids: Vec<_> = page.data.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, (1..=5).map(|i| json!(i)).collect::<Vec<_>>());

    let request = PageRequest::new(2, 2).order_by("id", SortDirection::Asc);
    let page = service.paginate("events", "metrics", &request).await.unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages, 3);
    let ids: Vec<_> = page.data.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(3), json!(4)]);
}

#[tokio::test]
async fn test_sharded_search_orders_by_primary_key() {
    let dir = tempfile::tempdir().unwrap();
    let service = setup(&dir).await;
    let records: Vec<Row> = (1..=25).map(sample).collect();
    service.bulk_insert("metrics", "metrics", &records).await.unwrap();

    let rows = service
        .search("metrics", "metrics", &["server_id".to_string()], "SRV-1", 3)
        .await
        .unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(6), json!(11)]);
}

#[tokio::test]
async fn test_sharded_point_operations() {
    let dir = tempfile::tempdir().unwrap();
    let service = setup(&dir).await;
    service
        .insert("metrics", "metrics", &sample(3))
        .await
        .unwrap();
    let key = json!("srv-3");

    // Without the shard key every shard is scanned
    let found = service
        .find_by_id("metrics", "metrics", &json!(3), None)
        .await
        .unwrap();
    assert_eq!(found.unwrap()["server_id"], key);
    let found = service
        .find_by_id("metrics", "metrics", &json!(3), Some(&key))
        .await
        .unwrap();
    assert!(found.is_some());

    let changes = row(json!({"cpu": 0.9}));
    let err = service
        .update("metrics", "metrics", &json!(3), &changes, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ShardRouting { .. }));
    let changed = service
        .update("metrics", "metrics", &json!(3), &changes, Some(&key))
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let rows = service
        .find_by_field("metrics", "metrics", "server_id", &key)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["cpu"], json!(0.9));

    let err = service
        .delete("metrics", "metrics", &json!(3), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ShardRouting { .. }));
    assert_eq!(
        service
            .delete("metrics", "metrics", &json!(3), Some(&key))
            .await
            .unwrap(),
        1
    );
    assert!(service
        .find_by_id("metrics", "metrics", &json!(3), None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_replicated_lookups_drop_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let service = UnifiedDatabaseService::from_configs([sharded(&dir, "events", 3, 2)]).unwrap();
    service.execute("events", METRICS_DDL, &[]).await.unwrap();

    let records: Vec<Row> = (1..=5).map(sample).collect();
    assert_eq!(
        service.bulk_insert("events", "metrics", &records).await.unwrap(),
        5
    );

    // Every row is stored twice but reported once
    let copies = service
        .query("events", "SELECT id FROM metrics", &[])
        .await
        .unwrap();
    assert_eq!(copies.row_count, 10);
    let rows = service
        .find_by_field("events", "metrics", "cpu", &json!(0.5))
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);

    let key = json!("srv-2");
    service
        .update("events", "metrics", &json!(2), &row(json!({"cpu": 0.1})), Some(&key))
        .await
        .unwrap();
    let stale = service
        .find_by_field("events", "metrics", "cpu", &json!(0.5))
        .await
        .unwrap();
    assert_eq!(stale.len(), 4);

    let index = IndexDefinition::new("idx_metrics_server", vec!["server_id".to_string()]);
    service.create_index("events", "metrics", &index).await.unwrap();
    let schema = service.get_table_schema("events", "metrics").await.unwrap();
    assert!(schema.indexes.iter().any(|i| i.name == "idx_metrics_server"));
    assert!(service.table_exists("events", "metrics").await.unwrap());
}

#[tokio::test]
async fn test_health_status_reports_every_database() {
    let dir = tempfile::tempdir().unwrap();
    let broken = ConnectionConfig::sqlite(
        dir.path().join("missing").join("broken.db").to_string_lossy(),
    )
    .with_timeout_secs(2);
    let service = UnifiedDatabaseService::from_configs([
        DatabaseConfig::single("main", DatabaseType::SQLite, sqlite(&dir, "main.db")),
        DatabaseConfig::single("broken", DatabaseType::SQLite, broken),
        sharded(&dir, "metrics", 2, 1),
    ])
    .unwrap();

    assert!(service.initialize().await.is_err());
    let report = service.get_health_status().await;
    assert!(!report.healthy);
    assert_eq!(report.databases.len(), 3);

    let main = &report.databases["main"];
    assert!(main.healthy);
    assert_eq!(main.kind, DatabaseKind::Single);
    assert!(main.metrics.contains_key("main"));

    let metrics = &report.databases["metrics"];
    assert!(metrics.healthy);
    assert_eq!(metrics.kind, DatabaseKind::Sharded);
    assert_eq!(metrics.shards.len(), 2);
    assert_eq!(metrics.metrics.len(), 2);

    let broken = &report.databases["broken"];
    assert!(!broken.healthy);
    assert!(broken.error.is_some());

    let per_shard = service.get_metrics("metrics").await.unwrap();
    assert_eq!(per_shard.len(), 2);

    service.shutdown().await;
    assert_eq!(service.factory().cached_count().await, 0);
}

#[tokio::test]
async fn test_unreachable_shard_is_reported_per_shard() {
    let dir = tempfile::tempdir().unwrap();
    let unreachable = ConnectionConfig::sqlite(
        dir.path().join("missing").join("s2.db").to_string_lossy(),
    )
    .with_timeout_secs(2);
    let spec = ShardingSpec::new("server_id")
        .with_shard("s1", sqlite(&dir, "partial-1.db"))
        .with_shard("s2", unreachable);
    let service = UnifiedDatabaseService::from_configs([DatabaseConfig::sharded(
        "metrics",
        DatabaseType::SQLite,
        spec,
    )])
    .unwrap();

    assert!(service.initialize().await.is_err());

    let report = service.get_health_status().await;
    let metrics = &report.databases["metrics"];
    assert!(!metrics.healthy);
    assert_eq!(metrics.shards.len(), 2);
    assert!(metrics.shards["s1"]);
    assert!(!metrics.shards["s2"]);
    assert_eq!(metrics.metrics.len(), 2);
    assert!(metrics.error.as_deref().unwrap().contains("s2"));

    // Keys owned by the live shard keep working
    let manager = service.shard_manager("metrics").await.unwrap();
    manager
        .live_shard("s1")
        .await
        .unwrap()
        .execute(METRICS_DDL, &[])
        .await
        .unwrap();
    let key = (0..)
        .map(|i| json!(format!("srv-{i}")))
        .find(|key| manager.get_shard_for_key(key).unwrap() == "s1")
        .unwrap();
    service
        .insert(
            "metrics",
            "metrics",
            &row(json!({"id": 1, "server_id": key, "cpu": 0.5})),
        )
        .await
        .unwrap();
    let found = service
        .find_by_id("metrics", "metrics", &json!(1), Some(&key))
        .await
        .unwrap();
    assert!(found.is_some());
}

#[tokio::test]
async fn test_reregistering_sharded_config_rebuilds_shards() {
    let dir = tempfile::tempdir().unwrap();
    let spec = ShardingSpec::new("server_id").with_shard("s1", sqlite(&dir, "m-s1.db"));
    let service = UnifiedDatabaseService::from_configs([DatabaseConfig::sharded(
        "m",
        DatabaseType::SQLite,
        spec,
    )])
    .unwrap();
    service.initialize().await.unwrap();
    let first = service.shard_manager("m").await.unwrap();
    assert_eq!(first.shard_ids(), vec!["s1".to_string()]);
    let old_shard = first.shard("s1").unwrap();

    let spec = ShardingSpec::new("server_id")
        .with_shard("x1", sqlite(&dir, "m-x1.db"))
        .with_shard("x2", sqlite(&dir, "m-x2.db"));
    service
        .register(DatabaseConfig::sharded("m", DatabaseType::SQLite, spec))
        .await
        .unwrap();
    assert!(!old_shard.is_connected().await);
    let second = service.shard_manager("m").await.unwrap();
    assert_eq!(second.shard_ids(), vec!["x1".to_string(), "x2".to_string()]);
    service.execute("m", METRICS_DDL, &[]).await.unwrap();

    // Replacing through the factory is picked up on the next lookup too
    let spec = ShardingSpec::new("server_id").with_shard("y1", sqlite(&dir, "m-y1.db"));
    service
        .factory()
        .register(DatabaseConfig::sharded("m", DatabaseType::SQLite, spec))
        .await
        .unwrap();
    let third = service.shard_manager("m").await.unwrap();
    assert_eq!(third.shard_ids(), vec!["y1".to_string()]);
    assert!(!second.shard("x1").unwrap().is_connected().await);
}
