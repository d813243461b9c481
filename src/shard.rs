//! Shard routing and fan-out.
//!
//! A [`ShardManager`] owns one [`DatabaseAdapter`] per shard of a sharded
//! logical database. Shard ids form a ring in sorted order; a key's owner is
//! the SHA-256 of its canonical string, first 8 bytes read as a big-endian
//! `u64`, modulo the shard count. Replicated writes go to the owner plus the
//! next `replication_factor - 1` shards around the ring.
//!
//! Fan-out is all-or-nothing: every shard is queried concurrently and one
//! failure fails the whole call.
//!
//! A shard that could not be reached when the manager started stays in the
//! ring disconnected. Routing to it retries the connection, and health
//! checks report it as down until it comes back.
//!
//! Adding or removing a shard reassigns some keys. Rows are not migrated;
//! rebalancing existing data is an offline maintenance task.

use crate::db::DatabaseAdapter;
use crate::error::{DbError, DbResult};
use crate::factory::build_adapter;
use crate::models::{
    ConnectionConfig, DatabaseConfig, DatabaseMetrics, QueryParam, QueryResult, Row,
};
use futures_util::future::{join_all, try_join_all};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Ring position of `key` among `shard_count` shards.
pub fn shard_index(key: &str, shard_count: usize) -> usize {
    if shard_count == 0 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shard_count as u64) as usize
}

/// Canonical routing string for a shard-key value.
///
/// Strings route by their content, so `"42"` and `42` land on the same
/// shard. Null cannot be routed.
pub fn shard_key_string(value: &JsonValue) -> DbResult<String> {
    match value {
        JsonValue::Null => Err(DbError::shard_routing("Shard key value is null")),
        JsonValue::String(s) => Ok(s.clone()),
        other => Ok(other.to_string()),
    }
}

/// Shards of one sharded logical database.
#[derive(Debug)]
pub struct ShardManager {
    name: String,
    shard_key: String,
    replication_factor: usize,
    config: DatabaseConfig,
    ring: RwLock<BTreeMap<String, Arc<DatabaseAdapter>>>,
}

impl ShardManager {
    /// Build disconnected adapters for every shard of `config`.
    pub fn new(config: &DatabaseConfig) -> DbResult<Self> {
        let sharding = config.sharding.as_ref().ok_or_else(|| {
            DbError::invalid_input(format!("Database '{}' is not sharded", config.name))
        })?;
        sharding
            .validate(config.db_type)
            .map_err(|e| DbError::invalid_input(e.to_string()))?;

        let ring = sharding
            .shards
            .iter()
            .map(|(id, endpoint)| {
                let adapter = build_adapter(shard_label(&config.name, id), config, endpoint.clone());
                (id.clone(), Arc::new(adapter))
            })
            .collect();

        Ok(Self {
            name: config.name.clone(),
            shard_key: sharding.shard_key.clone(),
            replication_factor: sharding.replication_factor,
            config: config.clone(),
            ring: RwLock::new(ring),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field whose value routes a row.
    pub fn shard_key(&self) -> &str {
        &self.shard_key
    }

    pub fn primary_key(&self) -> &str {
        &self.config.primary_key
    }

    /// Configuration the manager was built from.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Shard ids in ring order.
    pub fn shard_ids(&self) -> Vec<String> {
        self.read_ring().keys().cloned().collect()
    }

    pub fn shard_count(&self) -> usize {
        self.read_ring().len()
    }

    fn read_ring(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<DatabaseAdapter>>> {
        self.ring.read().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Vec<(String, Arc<DatabaseAdapter>)> {
        self.read_ring()
            .iter()
            .map(|(id, adapter)| (id.clone(), Arc::clone(adapter)))
            .collect()
    }

    /// Connect every shard concurrently. Fails if any shard fails.
    pub async fn connect_all(&self) -> DbResult<()> {
        let shards = self.snapshot();
        info!(database = %self.name, shards = shards.len(), "Connecting shards");
        try_join_all(shards.iter().map(|(_, adapter)| adapter.connect())).await?;
        Ok(())
    }

    /// Connect every shard concurrently, leaving unreachable ones
    /// disconnected. Returns the shards that failed.
    pub async fn connect_available(&self) -> Vec<(String, DbError)> {
        let shards = self.snapshot();
        info!(database = %self.name, shards = shards.len(), "Connecting shards");
        let attempts = shards
            .iter()
            .map(|(id, adapter)| async move { (id.clone(), adapter.connect().await) });
        let failed: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        for (id, e) in &failed {
            warn!(database = %self.name, shard = %id, error = %e, "Shard unavailable");
        }
        failed
    }

    pub async fn disconnect_all(&self) {
        for (id, adapter) in self.snapshot() {
            if let Err(e) = adapter.disconnect().await {
                warn!(database = %self.name, shard = %id, error = %e, "Failed to disconnect shard");
            }
        }
    }

    /// Owning shard id of `key`. Deterministic while the topology is unchanged.
    pub fn get_shard_for_key(&self, key: &JsonValue) -> DbResult<String> {
        let key = shard_key_string(key)?;
        let ring = self.read_ring();
        if ring.is_empty() {
            return Err(DbError::shard_routing(format!(
                "Database '{}' has no shards",
                self.name
            )));
        }
        let index = shard_index(&key, ring.len());
        ring.keys()
            .nth(index)
            .cloned()
            .ok_or_else(|| DbError::internal("Shard index out of range"))
    }

    pub fn shard(&self, id: &str) -> DbResult<Arc<DatabaseAdapter>> {
        self.read_ring().get(id).cloned().ok_or_else(|| {
            DbError::shard_routing(format!("Unknown shard '{}' in '{}'", id, self.name))
        })
    }

    /// Adapter of the shard owning `key`.
    pub fn adapter_for_key(&self, key: &JsonValue) -> DbResult<Arc<DatabaseAdapter>> {
        let id = self.get_shard_for_key(key)?;
        self.shard(&id)
    }

    /// Connected adapter of shard `id`.
    pub async fn live_shard(&self, id: &str) -> DbResult<Arc<DatabaseAdapter>> {
        reconnect(self.shard(id)?).await
    }

    /// Connected adapter of the shard owning `key`.
    pub async fn live_adapter_for_key(&self, key: &JsonValue) -> DbResult<Arc<DatabaseAdapter>> {
        reconnect(self.adapter_for_key(key)?).await
    }

    /// [`ShardManager::replica_set_for_key`] with every member connected.
    pub async fn live_replica_set_for_key(
        &self,
        key: &JsonValue,
    ) -> DbResult<Vec<(String, Arc<DatabaseAdapter>)>> {
        let targets = self.replica_set_for_key(key)?;
        try_join_all(
            targets
                .into_iter()
                .map(|(id, adapter)| async move { Ok::<_, DbError>((id, reconnect(adapter).await?)) }),
        )
        .await
    }

    /// Number of shards holding each row: the replication factor, capped at
    /// the shard count.
    pub fn copies_per_row(&self) -> usize {
        self.replication_factor.clamp(1, self.shard_count().max(1))
    }

    /// Owner of `key` followed by its `replication_factor - 1` ring successors.
    pub fn replica_set_for_key(
        &self,
        key: &JsonValue,
    ) -> DbResult<Vec<(String, Arc<DatabaseAdapter>)>> {
        let key = shard_key_string(key)?;
        let shards = self.snapshot();
        if shards.is_empty() {
            return Err(DbError::shard_routing(format!(
                "Database '{}' has no shards",
                self.name
            )));
        }
        let owner = shard_index(&key, shards.len());
        let copies = self.replication_factor.clamp(1, shards.len());
        Ok((0..copies)
            .map(|step| shards[(owner + step) % shards.len()].clone())
            .collect())
    }

    /// Shard-key value of `row`.
    pub fn shard_key_value<'r>(&self, row: &'r Row) -> DbResult<&'r JsonValue> {
        match row.get(&self.shard_key) {
            Some(value) if !value.is_null() => Ok(value),
            _ => Err(DbError::shard_routing(format!(
                "Row is missing shard key '{}'",
                self.shard_key
            ))),
        }
    }

    /// Insert `row` into its owning shard and its replicas. Returns the row
    /// as stored by the owner.
    pub async fn distribute_data(&self, table: &str, row: &Row) -> DbResult<Row> {
        let key = self.shard_key_value(row)?;
        let targets = self.live_replica_set_for_key(key).await?;
        debug!(
            database = %self.name,
            table = %table,
            shards = ?targets.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            "Distributing row"
        );
        let stored = try_join_all(
            targets
                .iter()
                .map(|(_, adapter)| adapter.insert(table, row)),
        )
        .await?;
        stored
            .into_iter()
            .next()
            .ok_or_else(|| DbError::internal("Replica set is empty"))
    }

    /// Run a statement on the one shard owning `key`.
    pub async fn query_shard_by_key(
        &self,
        key: &JsonValue,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        self.live_adapter_for_key(key).await?.query(sql, params).await
    }

    /// Run `work` against every shard concurrently, in ring order.
    pub async fn fan_out<T, F, Fut>(&self, work: F) -> DbResult<Vec<(String, T)>>
    where
        F: Fn(Arc<DatabaseAdapter>) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let shards = self.snapshot();
        let results = try_join_all(shards.iter().map(|(_, adapter)| async {
            let adapter = reconnect(Arc::clone(adapter)).await?;
            work(adapter).await
        }))
        .await?;
        Ok(shards.into_iter().map(|(id, _)| id).zip(results).collect())
    }

    /// Per-shard results of `sql`, for caller-side aggregation such as
    /// summing per-shard counts.
    pub async fn query_each_shard(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<(String, QueryResult)>> {
        self.fan_out(|adapter| async move { adapter.query(sql, params).await })
            .await
    }

    /// Concatenated rows of `sql` from every shard.
    pub async fn query_all_shards(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let parts = self.query_each_shard(sql, params).await?;
        Ok(QueryResult::merge(parts.into_iter().map(|(_, result)| result)))
    }

    /// Run a statement on every shard and sum the affected rows.
    pub async fn execute_all_shards(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let counts = self
            .fan_out(|adapter| async move { adapter.execute(sql, params).await })
            .await?;
        Ok(counts.into_iter().map(|(_, count)| count).sum())
    }

    /// Health per shard id. Never fails; a shard that still cannot connect
    /// reports `false`.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let shards = self.snapshot();
        let checks = shards.iter().map(|(id, adapter)| async move {
            let healthy = match reconnect(Arc::clone(adapter)).await {
                Ok(adapter) => adapter.health_check().await,
                Err(_) => false,
            };
            (id.clone(), healthy)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Metrics per shard id.
    pub async fn get_metrics_all(&self) -> BTreeMap<String, DatabaseMetrics> {
        let shards = self.snapshot();
        let snapshots = shards
            .iter()
            .map(|(id, adapter)| async move { (id.clone(), adapter.get_metrics().await) });
        join_all(snapshots).await.into_iter().collect()
    }

    /// Connect a new shard and add it to the ring.
    ///
    /// Keys that now hash to the new shard keep their rows where they were.
    pub async fn add_shard(&self, id: &str, endpoint: ConnectionConfig) -> DbResult<()> {
        if self.read_ring().contains_key(id) {
            return Err(DbError::invalid_input(format!(
                "Shard '{}' already exists in '{}'",
                id, self.name
            )));
        }
        endpoint
            .validate(self.config.db_type)
            .map_err(|e| DbError::invalid_input(e.to_string()))?;

        let adapter = Arc::new(build_adapter(shard_label(&self.name, id), &self.config, endpoint));
        adapter.connect().await?;

        let count = {
            let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());
            ring.insert(id.to_string(), adapter);
            ring.len()
        };
        warn!(
            database = %self.name,
            shard = %id,
            shards = count,
            "Shard added; existing rows are not migrated and some keys now route elsewhere"
        );
        Ok(())
    }

    /// Remove a shard from the ring and disconnect it.
    ///
    /// Rows it held are not moved. The ring must keep at least
    /// `replication_factor` shards.
    pub async fn remove_shard(&self, id: &str) -> DbResult<()> {
        let (removed, count) = {
            let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());
            if !ring.contains_key(id) {
                return Err(DbError::shard_routing(format!(
                    "Unknown shard '{}' in '{}'",
                    id, self.name
                )));
            }
            if ring.len() <= self.replication_factor.max(1) {
                return Err(DbError::invalid_input(format!(
                    "Cannot remove shard '{}': '{}' needs at least {} shard(s)",
                    id,
                    self.name,
                    self.replication_factor.max(1)
                )));
            }
            let removed = ring.remove(id);
            (removed, ring.len())
        };
        if let Some(adapter) = removed {
            adapter.disconnect().await?;
        }
        warn!(
            database = %self.name,
            shard = %id,
            shards = count,
            "Shard removed; its rows are no longer reachable until migrated"
        );
        Ok(())
    }
}

/// Connect `adapter` if an earlier attempt left it disconnected.
async fn reconnect(adapter: Arc<DatabaseAdapter>) -> DbResult<Arc<DatabaseAdapter>> {
    if !adapter.is_connected().await {
        adapter.connect().await?;
    }
    Ok(adapter)
}

fn shard_label(database: &str, shard: &str) -> String {
    format!("{}/{}", database, shard)
}
