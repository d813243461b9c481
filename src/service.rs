//! Unified database service.
//!
//! [`UnifiedDatabaseService`] is the façade callers use. Per logical database
//! name it routes either to one cached adapter (with replica failover when
//! replicas are configured) or to a [`ShardManager`]; the operations look
//! the same either way.
//!
//! On sharded databases:
//! - `update` and `delete` need the shard-key value; `find_by_id` without it
//!   scans every shard.
//! - `paginate` pulls the first `page * limit` rows from every shard, drops
//!   replicated copies, re-sorts in memory, then slices the page. This is
//!   correct but not index-accelerated across shards.
//! - Transactions are not available; they would span shards.

use crate::db::{DatabaseAdapter, TransactionContext};
use crate::error::{DbError, DbResult};
use crate::factory::AdapterFactory;
use crate::models::{
    DatabaseConfig, DatabaseHealth, DatabaseKind, DatabaseMetrics, HealthReport, IndexDefinition,
    PageRequest, PaginatedResult, QueryParam, QueryResult, Row, RowUpdate, SortDirection,
    TableSchema,
};
use crate::shard::{ShardManager, shard_key_string};
use futures_util::future::{BoxFuture, try_join_all};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tracing::{debug, info, warn};

type ShardCell = Arc<OnceCell<Arc<ShardManager>>>;

/// Where a logical name is served from.
#[derive(Debug, Clone)]
enum Target {
    Single(Arc<DatabaseAdapter>),
    Sharded(Arc<ShardManager>),
}

/// Single entry point over every configured database.
#[derive(Debug)]
pub struct UnifiedDatabaseService {
    factory: AdapterFactory,
    shard_managers: TokioRwLock<HashMap<String, ShardCell>>,
}

impl UnifiedDatabaseService {
    pub fn new(factory: AdapterFactory) -> Self {
        Self {
            factory,
            shard_managers: TokioRwLock::new(HashMap::new()),
        }
    }

    /// Build a service over validated configurations.
    pub fn from_configs(configs: impl IntoIterator<Item = DatabaseConfig>) -> DbResult<Self> {
        Ok(Self::new(AdapterFactory::with_configs(configs)?))
    }

    pub fn factory(&self) -> &AdapterFactory {
        &self.factory
    }

    pub async fn database_names(&self) -> Vec<String> {
        self.factory.names().await
    }

    /// Add or replace a configuration. Adapters and shards built from the
    /// previous configuration are closed.
    pub async fn register(&self, config: DatabaseConfig) -> DbResult<()> {
        let name = config.name.clone();
        self.factory.register(config).await?;
        self.evict_shard_manager(&name).await;
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect every configured database, every shard included. Fails on
    /// the first database that cannot be reached.
    pub async fn initialize(&self) -> DbResult<()> {
        let names = self.factory.names().await;
        info!(count = names.len(), "Initializing databases");
        try_join_all(names.iter().map(|name| async move {
            if let Target::Sharded(manager) = self.target(name).await? {
                manager.connect_all().await?;
            }
            Ok::<_, DbError>(())
        }))
        .await?;
        info!("All databases initialized");
        Ok(())
    }

    /// Close every adapter and shard.
    pub async fn shutdown(&self) {
        let managers: Vec<_> = {
            let mut managers = self.shard_managers.write().await;
            managers.drain().collect()
        };
        for (name, cell) in managers {
            if let Some(manager) = cell.get() {
                info!(database = %name, "Closing shards");
                manager.disconnect_all().await;
            }
        }
        self.factory.close_all_adapters().await;
        info!("Database service shut down");
    }

    /// Shard manager for a sharded logical name, connecting it on first use.
    ///
    /// Shards that cannot be reached stay in the ring disconnected and are
    /// retried when routed to. A manager built from a configuration that has
    /// since been replaced is closed and rebuilt.
    pub async fn shard_manager(&self, name: &str) -> DbResult<Arc<ShardManager>> {
        let config = self.factory.config(name).await?;
        if !config.is_sharded() {
            return Err(DbError::invalid_input(format!(
                "Database '{}' is not sharded",
                name
            )));
        }
        let mut cell = self.shard_cell(name).await;
        if let Some(stale) = cell.get().filter(|m| *m.config() != config).cloned() {
            info!(database = %name, "Configuration changed, rebuilding shards");
            {
                let mut managers = self.shard_managers.write().await;
                if managers.get(name).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                    managers.remove(name);
                }
            }
            stale.disconnect_all().await;
            cell = self.shard_cell(name).await;
        }
        let manager = cell
            .get_or_try_init(|| async {
                let manager = ShardManager::new(&config)?;
                manager.connect_available().await;
                Ok::<_, DbError>(Arc::new(manager))
            })
            .await?;
        Ok(Arc::clone(manager))
    }

    async fn shard_cell(&self, name: &str) -> ShardCell {
        {
            let managers = self.shard_managers.read().await;
            if let Some(cell) = managers.get(name) {
                return Arc::clone(cell);
            }
        }
        let mut managers = self.shard_managers.write().await;
        Arc::clone(
            managers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Drop the cached shard manager of `name` and close its shards.
    async fn evict_shard_manager(&self, name: &str) {
        let cell = self.shard_managers.write().await.remove(name);
        if let Some(manager) = cell.as_ref().and_then(|cell| cell.get()) {
            info!(database = %name, "Closing shards");
            manager.disconnect_all().await;
        }
    }

    async fn target(&self, name: &str) -> DbResult<Target> {
        let config = self.factory.config(name).await?;
        if config.is_sharded() {
            return Ok(Target::Sharded(self.shard_manager(name).await?));
        }
        let adapter = if config.replicas.is_empty() {
            self.factory.create_adapter(name).await?
        } else {
            self.factory.create_adapter_with_failover(name).await?
        };
        Ok(Target::Single(adapter))
    }

    // =========================================================================
    // Raw statements
    // =========================================================================

    /// Run a statement; on a sharded name the rows of every shard are
    /// concatenated.
    pub async fn query(&self, name: &str, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.query(sql, params).await,
            Target::Sharded(manager) => manager.query_all_shards(sql, params).await,
        }
    }

    /// Run a statement on the shard owning `key`. Non-sharded names ignore
    /// the key.
    pub async fn query_by_shard_key(
        &self,
        name: &str,
        key: &JsonValue,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.query(sql, params).await,
            Target::Sharded(manager) => manager.query_shard_by_key(key, sql, params).await,
        }
    }

    /// Run a statement; on a sharded name it runs on every shard and the
    /// affected counts are summed.
    pub async fn execute(&self, name: &str, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.execute(sql, params).await,
            Target::Sharded(manager) => manager.execute_all_shards(sql, params).await,
        }
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    pub async fn insert(&self, name: &str, table: &str, record: &Row) -> DbResult<Row> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.insert(table, record).await,
            Target::Sharded(manager) => manager.distribute_data(table, record).await,
        }
    }

    /// Insert many records. On a sharded name the records are grouped per
    /// target shard (replicas included) and each group is bulk-inserted.
    /// Returns the number of records stored on their owning shards.
    pub async fn bulk_insert(&self, name: &str, table: &str, records: &[Row]) -> DbResult<u64> {
        let manager = match self.target(name).await? {
            Target::Single(adapter) => return adapter.bulk_insert(table, records).await,
            Target::Sharded(manager) => manager,
        };

        let mut groups: BTreeMap<String, (Arc<DatabaseAdapter>, Vec<Row>, u64)> = BTreeMap::new();
        for record in records {
            let key = manager.shard_key_value(record)?;
            let replicas = manager.live_replica_set_for_key(key).await?;
            for (position, (id, adapter)) in replicas.into_iter().enumerate() {
                let group = groups
                    .entry(id)
                    .or_insert_with(|| (adapter, Vec::new(), 0));
                group.1.push(record.clone());
                if position == 0 {
                    group.2 += 1;
                }
            }
        }
        debug!(database = %name, table = %table, shards = groups.len(), "Grouped bulk insert");

        try_join_all(
            groups
                .values()
                .map(|(adapter, rows, _)| adapter.bulk_insert(table, rows)),
        )
        .await?;
        Ok(groups.values().map(|(_, _, owned)| owned).sum())
    }

    /// Update the row with primary key `id`. Sharded names need the row's
    /// shard-key value; every copy of the row is updated and the owner's
    /// count is returned.
    pub async fn update(
        &self,
        name: &str,
        table: &str,
        id: &JsonValue,
        changes: &Row,
        shard_key: Option<&JsonValue>,
    ) -> DbResult<u64> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.update(table, id, changes).await,
            Target::Sharded(manager) => {
                let key = require_shard_key(&manager, shard_key, "update")?;
                let counts = try_join_all(
                    manager
                        .live_replica_set_for_key(key)
                        .await?
                        .iter()
                        .map(|(_, adapter)| adapter.update(table, id, changes)),
                )
                .await?;
                Ok(counts.first().copied().unwrap_or(0))
            }
        }
    }

    /// Delete the row with primary key `id`. Same shard-key rule as `update`.
    pub async fn delete(
        &self,
        name: &str,
        table: &str,
        id: &JsonValue,
        shard_key: Option<&JsonValue>,
    ) -> DbResult<u64> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.delete(table, id).await,
            Target::Sharded(manager) => {
                let key = require_shard_key(&manager, shard_key, "delete")?;
                let counts = try_join_all(
                    manager
                        .live_replica_set_for_key(key)
                        .await?
                        .iter()
                        .map(|(_, adapter)| adapter.delete(table, id)),
                )
                .await?;
                Ok(counts.first().copied().unwrap_or(0))
            }
        }
    }

    /// Row with primary key `id`. Without a shard key a sharded name is
    /// scanned shard by shard concurrently; the first match in ring order
    /// wins.
    pub async fn find_by_id(
        &self,
        name: &str,
        table: &str,
        id: &JsonValue,
        shard_key: Option<&JsonValue>,
    ) -> DbResult<Option<Row>> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.find_by_id(table, id).await,
            Target::Sharded(manager) => match shard_key {
                Some(key) => {
                    manager
                        .live_adapter_for_key(key)
                        .await?
                        .find_by_id(table, id)
                        .await
                }
                None => {
                    debug!(database = %name, table = %table, "find_by_id without shard key, scanning all shards");
                    let found = manager
                        .fan_out(|adapter| async move { adapter.find_by_id(table, id).await })
                        .await?;
                    Ok(found.into_iter().find_map(|(_, row)| row))
                }
            },
        }
    }

    /// Rows whose `field` equals `value`. On a sharded name a shard-key
    /// lookup goes to one shard; anything else fans out and drops replicated
    /// duplicates by primary key.
    pub async fn find_by_field(
        &self,
        name: &str,
        table: &str,
        field: &str,
        value: &JsonValue,
    ) -> DbResult<Vec<Row>> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.find_by_field(table, field, value).await,
            Target::Sharded(manager) => {
                if field == manager.shard_key() {
                    return manager
                        .live_adapter_for_key(value)
                        .await?
                        .find_by_field(table, field, value)
                        .await;
                }
                let parts = manager
                    .fan_out(|adapter| async move { adapter.find_by_field(table, field, value).await })
                    .await?;
                let rows = parts.into_iter().flat_map(|(_, rows)| rows).collect();
                Ok(dedup_by_key(rows, manager.primary_key()))
            }
        }
    }

    /// Apply each update in one transaction. Not available on sharded names.
    pub async fn bulk_update(&self, name: &str, table: &str, updates: &[RowUpdate]) -> DbResult<u64> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.bulk_update(table, updates).await,
            Target::Sharded(_) => Err(DbError::unsupported(
                "bulk_update",
                format!("'{}' is sharded; an atomic batch would span shards", name),
            )),
        }
    }

    // =========================================================================
    // Pagination and search
    // =========================================================================

    pub async fn paginate(
        &self,
        name: &str,
        table: &str,
        request: &PageRequest,
    ) -> DbResult<PaginatedResult> {
        let manager = match self.target(name).await? {
            Target::Single(adapter) => return adapter.paginate(table, request).await,
            Target::Sharded(manager) => manager,
        };
        request.validate().map_err(DbError::invalid_input)?;

        let window = request.page.saturating_mul(request.limit);
        let parts = manager
            .fan_out(|adapter| async move {
                adapter.count_and_window(table, request, window, 0).await
            })
            .await?;

        let mut stored = 0;
        let mut rows = Vec::new();
        for (_, (count, part)) in parts {
            stored += count;
            rows.extend(part);
        }
        // Each logical row is stored on `copies` shards
        let copies = manager.copies_per_row() as u64;
        let total = stored / copies;
        let mut rows = if copies > 1 {
            dedup_by_key(rows, manager.primary_key())
        } else {
            rows
        };
        sort_rows(&mut rows, request.order_column(), request.direction);
        let data = rows
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.limit as usize)
            .collect();
        Ok(PaginatedResult::new(data, total, request.page, request.limit))
    }

    /// Case-insensitive search ordered by primary key, at most `limit` rows.
    pub async fn search(
        &self,
        name: &str,
        table: &str,
        fields: &[String],
        term: &str,
        limit: u64,
    ) -> DbResult<Vec<Row>> {
        let manager = match self.target(name).await? {
            Target::Single(adapter) => return adapter.search(table, fields, term, limit).await,
            Target::Sharded(manager) => manager,
        };
        let parts = manager
            .fan_out(|adapter| async move { adapter.search(table, fields, term, limit).await })
            .await?;
        let rows = parts.into_iter().flat_map(|(_, rows)| rows).collect();
        let mut rows = dedup_by_key(rows, manager.primary_key());
        sort_rows(&mut rows, manager.primary_key(), SortDirection::Asc);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// On a sharded name the table must exist on every shard.
    pub async fn table_exists(&self, name: &str, table: &str) -> DbResult<bool> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.table_exists(table).await,
            Target::Sharded(manager) => {
                let parts = manager
                    .fan_out(|adapter| async move { adapter.table_exists(table).await })
                    .await?;
                Ok(parts.into_iter().all(|(_, exists)| exists))
            }
        }
    }

    /// Shards share one schema, so the first shard answers.
    pub async fn get_table_schema(&self, name: &str, table: &str) -> DbResult<TableSchema> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.get_table_schema(table).await,
            Target::Sharded(manager) => {
                let first = manager
                    .shard_ids()
                    .into_iter()
                    .next()
                    .ok_or_else(|| DbError::shard_routing(format!("'{}' has no shards", name)))?;
                manager.live_shard(&first).await?.get_table_schema(table).await
            }
        }
    }

    pub async fn create_index(
        &self,
        name: &str,
        table: &str,
        index: &IndexDefinition,
    ) -> DbResult<()> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.create_index(table, index).await,
            Target::Sharded(manager) => {
                manager
                    .fan_out(|adapter| async move { adapter.create_index(table, index).await })
                    .await?;
                Ok(())
            }
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Open a transaction on a non-sharded name.
    pub async fn begin_transaction(&self, name: &str) -> DbResult<TransactionContext> {
        match self.target(name).await? {
            Target::Single(adapter) => adapter.begin_transaction().await,
            Target::Sharded(_) => Err(sharded_transaction_error(name)),
        }
    }

    /// Run `work` inside a transaction. `Ok` commits, `Err` rolls back and
    /// returns the work's error.
    ///
    /// ```ignore
    /// let id = service
    ///     .execute_transaction("main", |tx| {
    ///         Box::pin(async move {
    ///             let row = tx.insert("orders", &order).await?;
    ///             tx.update("stock", &item_id, &changes).await?;
    ///             Ok(row["id"].clone())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute_transaction<T, F>(&self, name: &str, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut TransactionContext) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut tx = self.begin_transaction(name).await?;
        match work(&mut tx).await {
            Ok(value) => {
                // The work may have closed the transaction itself
                if tx.is_active() {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                if tx.is_active() {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(database = %name, transaction_id = %tx.id(), error = %rollback_err, "Rollback failed");
                    }
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Health and metrics of every configured database. Never fails; a
    /// database that cannot be reached is reported unhealthy with its error.
    pub async fn get_health_status(&self) -> HealthReport {
        let names = self.factory.names().await;
        let reports = names.iter().map(|name| async move {
            (name.clone(), self.database_health(name).await)
        });
        HealthReport::new(futures_util::future::join_all(reports).await.into_iter().collect())
    }

    async fn database_health(&self, name: &str) -> DatabaseHealth {
        let sharded = self
            .factory
            .config(name)
            .await
            .map(|c| c.is_sharded())
            .unwrap_or(false);
        let kind = if sharded {
            DatabaseKind::Sharded
        } else {
            DatabaseKind::Single
        };

        match self.target(name).await {
            Ok(Target::Single(adapter)) => {
                let healthy = adapter.health_check().await;
                DatabaseHealth {
                    kind,
                    healthy,
                    shards: BTreeMap::new(),
                    metrics: BTreeMap::from([(name.to_string(), adapter.get_metrics().await)]),
                    error: None,
                }
            }
            Ok(Target::Sharded(manager)) => {
                let shards = manager.health_check_all().await;
                let down: Vec<&str> = shards
                    .iter()
                    .filter(|(_, healthy)| !**healthy)
                    .map(|(id, _)| id.as_str())
                    .collect();
                let healthy = !shards.is_empty() && down.is_empty();
                let error = (!down.is_empty())
                    .then(|| format!("Unhealthy shards: {}", down.join(", ")));
                DatabaseHealth {
                    kind,
                    healthy,
                    shards,
                    metrics: manager.get_metrics_all().await,
                    error,
                }
            }
            Err(e) => {
                warn!(database = %name, error = %e, "Health check could not reach database");
                DatabaseHealth {
                    kind,
                    healthy: false,
                    shards: BTreeMap::new(),
                    metrics: BTreeMap::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Metrics per adapter (or per shard) of one logical name.
    pub async fn get_metrics(&self, name: &str) -> DbResult<BTreeMap<String, DatabaseMetrics>> {
        Ok(match self.target(name).await? {
            Target::Single(adapter) => {
                BTreeMap::from([(name.to_string(), adapter.get_metrics().await)])
            }
            Target::Sharded(manager) => manager.get_metrics_all().await,
        })
    }
}

fn require_shard_key<'k>(
    manager: &ShardManager,
    shard_key: Option<&'k JsonValue>,
    operation: &str,
) -> DbResult<&'k JsonValue> {
    shard_key.ok_or_else(|| {
        DbError::shard_routing(format!(
            "{} on sharded database '{}' requires a value for shard key '{}'",
            operation,
            manager.name(),
            manager.shard_key()
        ))
    })
}

fn sharded_transaction_error(name: &str) -> DbError {
    DbError::unsupported(
        "transaction",
        format!("'{}' is sharded; distributed transactions are not supported", name),
    )
}

/// Drop rows whose primary key was already seen. Rows without the key are
/// kept.
fn dedup_by_key(rows: Vec<Row>, key: &str) -> Vec<Row> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| match row.get(key).and_then(|v| shard_key_string(v).ok()) {
            Some(id) => seen.insert(id),
            None => true,
        })
        .collect()
}

/// Stable in-memory sort of merged shard rows.
fn sort_rows(rows: &mut [Row], column: &str, direction: SortDirection) {
    rows.sort_by(|a, b| {
        let ordering = compare_json(
            a.get(column).unwrap_or(&JsonValue::Null),
            b.get(column).unwrap_or(&JsonValue::Null),
        );
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
}

/// Total order over JSON scalars: null < bool < number < string < other.
fn compare_json(a: &JsonValue, b: &JsonValue) -> Ordering {
    fn rank(v: &JsonValue) -> u8 {
        match v {
            JsonValue::Null => 0,
            JsonValue::Bool(_) => 1,
            JsonValue::Number(_) => 2,
            JsonValue::String(_) => 3,
            JsonValue::Array(_) | JsonValue::Object(_) => 4,
        }
    }
    match (a, b) {
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .total_cmp(&y.as_f64().unwrap_or(0.0)),
        },
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}
