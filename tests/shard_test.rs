//! Integration tests for shard routing, replication and topology changes,
//! using one SQLite file per shard.

use serde_json::{Value as JsonValue, json};
use tempfile::TempDir;
use unidb::models::{ConnectionConfig, DatabaseConfig, DatabaseType, QueryParam, Row, ShardingSpec};
use unidb::{DbError, ShardManager};

const METRICS_DDL: &str = "CREATE TABLE metrics (
    id INTEGER PRIMARY KEY,
    server_id TEXT NOT NULL,
    cpu REAL
)";

fn row(value: JsonValue) -> Row {
    value.as_object().cloned().unwrap()
}

fn sharded_config(dir: &TempDir, shards: usize, replication_factor: usize) -> DatabaseConfig {
    let spec = (1..=shards).fold(ShardingSpec::new("server_id"), |spec, i| {
        let path = dir.path().join(format!("shard{i}.db"));
        spec.with_shard(format!("s{i}"), ConnectionConfig::sqlite(path.to_string_lossy()))
    });
    DatabaseConfig::sharded(
        "metrics",
        DatabaseType::SQLite,
        spec.with_replication_factor(replication_factor),
    )
}

async fn setup(dir: &TempDir, shards: usize, replication_factor: usize) -> ShardManager {
    let manager = ShardManager::new(&sharded_config(dir, shards, replication_factor)).unwrap();
    manager.connect_all().await.unwrap();
    manager.execute_all_shards(METRICS_DDL, &[]).await.unwrap();
    manager
}

/// Shard ids whose `metrics` table holds a row with primary key `id`.
async fn holders(manager: &ShardManager, id: i64) -> Vec<String> {
    let mut found = Vec::new();
    for shard in manager.shard_ids() {
        let adapter = manager.shard(&shard).unwrap();
        if adapter.find_by_id("metrics", &json!(id)).await.unwrap().is_some() {
            found.push(shard);
        }
    }
    found
}

#[tokio::test]
async fn test_query_all_shards_concatenates_rows() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(&dir, 3, 1).await;

    let mut id = 0;
    for shard in manager.shard_ids() {
        let adapter = manager.shard(&shard).unwrap();
        for _ in 0..10 {
            id += 1;
            adapter
                .insert(
                    "metrics",
                    &row(json!({"id": id, "server_id": format!("srv-{id}"), "cpu": 0.5})),
                )
                .await
                .unwrap();
        }
    }

    let result = manager
        .query_all_shards("SELECT * FROM metrics", &[])
        .await
        .unwrap();
    assert_eq!(result.row_count, 30);
    assert_eq!(result.rows.len(), 30);
    assert!(result.fields.contains(&"server_id".to_string()));

    let per_shard = manager
        .query_each_shard("SELECT COUNT(*) AS cnt FROM metrics", &[])
        .await
        .unwrap();
    assert_eq!(per_shard.len(), 3);
    assert!(per_shard.iter().all(|(_, r)| r.rows[0]["cnt"] == json!(10)));

    let deleted = manager
        .execute_all_shards("DELETE FROM metrics WHERE cpu > ?", &[QueryParam::Float(0.1)])
        .await
        .unwrap();
    assert_eq!(deleted, 30);
}

#[tokio::test]
async fn test_rows_live_on_the_owning_shard() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(&dir, 2, 1).await;

    let mut id = 0;
    for server in ["srv-1", "srv-2", "srv-3", "srv-4"] {
        for _ in 0..3 {
            id += 1;
            let stored = manager
                .distribute_data(
                    "metrics",
                    &row(json!({"id": id, "server_id": server, "cpu": 0.25})),
                )
                .await
                .unwrap();
            assert_eq!(stored["server_id"], json!(server));
        }
    }

    let result = manager
        .query_shard_by_key(
            &json!("srv-1"),
            "SELECT * FROM metrics WHERE server_id = ?",
            &[QueryParam::from("srv-1")],
        )
        .await
        .unwrap();
    assert_eq!(result.row_count, 3);
    assert!(result.rows.iter().all(|r| r["server_id"] == json!("srv-1")));

    // No other shard holds srv-1 rows
    let owner = manager.get_shard_for_key(&json!("srv-1")).unwrap();
    for shard in manager.shard_ids().into_iter().filter(|s| *s != owner) {
        let rows = manager
            .shard(&shard)
            .unwrap()
            .find_by_field("metrics", "server_id", &json!("srv-1"))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    let total = manager
        .query_all_shards("SELECT id FROM metrics", &[])
        .await
        .unwrap();
    assert_eq!(total.row_count, 12);
}

#[tokio::test]
async fn test_replicated_rows_reach_every_copy() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(&dir, 3, 2).await;

    for id in 1..=10 {
        manager
            .distribute_data(
                "metrics",
                &row(json!({"id": id, "server_id": format!("host-{id}"), "cpu": 1.0})),
            )
            .await
            .unwrap();
    }

    for id in 1..=10 {
        let key = json!(format!("host-{id}"));
        let expected: Vec<String> = manager
            .replica_set_for_key(&key)
            .unwrap()
            .into_iter()
            .map(|(shard, _)| shard)
            .collect();
        assert_eq!(expected.len(), 2);
        assert_eq!(expected[0], manager.get_shard_for_key(&key).unwrap());

        let mut found = holders(&manager, id).await;
        found.sort();
        let mut expected = expected;
        expected.sort();
        assert_eq!(found, expected, "row {id}");
    }
}

#[tokio::test]
async fn test_missing_shard_key_is_a_routing_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(&dir, 2, 1).await;

    let err = manager
        .distribute_data("metrics", &row(json!({"id": 1, "cpu": 0.1})))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ShardRouting { .. }));

    let err = manager
        .distribute_data("metrics", &row(json!({"id": 1, "server_id": null})))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ShardRouting { .. }));
}

#[tokio::test]
async fn test_add_and_remove_shard() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(&dir, 2, 1).await;
    assert_eq!(manager.shard_ids(), vec!["s1".to_string(), "s2".to_string()]);

    let extra = ConnectionConfig::sqlite(dir.path().join("shard3.db").to_string_lossy());
    manager.add_shard("s3", extra.clone()).await.unwrap();
    assert_eq!(manager.shard_count(), 3);
    assert!(manager.shard("s3").unwrap().is_connected().await);

    let err = manager.add_shard("s3", extra).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));

    // Routing over the grown ring is still deterministic
    let key = json!("srv-42");
    let owner = manager.get_shard_for_key(&key).unwrap();
    assert_eq!(manager.get_shard_for_key(&key).unwrap(), owner);
    assert!(manager.shard_ids().contains(&owner));

    let health = manager.health_check_all().await;
    assert_eq!(health.len(), 3);
    assert!(health.values().all(|h| *h));

    let removed = manager.shard("s3").unwrap();
    manager.remove_shard("s3").await.unwrap();
    assert!(!removed.is_connected().await);
    assert_eq!(manager.shard_count(), 2);

    let err = manager.remove_shard("s3").await.unwrap_err();
    assert!(matches!(err, DbError::ShardRouting { .. }));
}
