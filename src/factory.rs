//! Adapter factory.
//!
//! Creates, caches and health-checks one [`DatabaseAdapter`] per logical
//! database name.
//!
//! # Concurrency
//!
//! - **`OnceCell` per name**: concurrent first calls for the same name wait
//!   for a single connection attempt instead of racing to open two pools.
//!   A failed attempt leaves the cell empty so the next call retries.
//! - All locks are released before awaiting connects, disconnects or health
//!   checks.
//! - Health and metrics fan-out never fails: one unreachable backend shows
//!   up as `false` in the result map.

use crate::db::DatabaseAdapter;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseConfig, DatabaseMetrics};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tracing::{debug, info, warn};

type AdapterCell = Arc<OnceCell<Arc<DatabaseAdapter>>>;

/// Build a disconnected adapter for one endpoint of `config`.
pub(crate) fn build_adapter(
    label: impl Into<String>,
    config: &DatabaseConfig,
    endpoint: ConnectionConfig,
) -> DatabaseAdapter {
    DatabaseAdapter::new(label, config.db_type, endpoint)
        .with_primary_key(config.primary_key.clone())
        .with_transaction_timeout(Duration::from_secs(
            config.transaction_timeout_or_default(),
        ))
}

/// Registry of database configurations and their live adapters.
#[derive(Debug, Default)]
pub struct AdapterFactory {
    configs: TokioRwLock<BTreeMap<String, DatabaseConfig>>,
    adapters: TokioRwLock<HashMap<String, AdapterCell>>,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a factory from a set of configurations, validating each.
    pub fn with_configs(configs: impl IntoIterator<Item = DatabaseConfig>) -> DbResult<Self> {
        let mut map = BTreeMap::new();
        for config in configs {
            config
                .validate()
                .map_err(|e| DbError::invalid_input(e.to_string()))?;
            if map.contains_key(&config.name) {
                return Err(DbError::invalid_input(format!(
                    "Database '{}' is configured more than once",
                    config.name
                )));
            }
            map.insert(config.name.clone(), config);
        }
        Ok(Self {
            configs: TokioRwLock::new(map),
            adapters: TokioRwLock::new(HashMap::new()),
        })
    }

    /// Add or replace a configuration. A cached adapter for the same name is
    /// closed so the next call picks up the new settings.
    pub async fn register(&self, config: DatabaseConfig) -> DbResult<()> {
        config
            .validate()
            .map_err(|e| DbError::invalid_input(e.to_string()))?;
        let name = config.name.clone();
        let replaced = self.configs.write().await.insert(name.clone(), config);
        if replaced.is_some() {
            info!(database = %name, "Configuration replaced");
            self.close_adapter(&name).await?;
        }
        Ok(())
    }

    /// Configured logical names, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.configs.read().await.keys().cloned().collect()
    }

    pub async fn config(&self, name: &str) -> DbResult<DatabaseConfig> {
        let configs = self.configs.read().await;
        configs.get(name).cloned().ok_or_else(|| {
            let known: Vec<&str> = configs.keys().map(String::as_str).collect();
            DbError::database_not_found(
                name,
                if known.is_empty() {
                    "No databases are configured".to_string()
                } else {
                    format!("Configured databases: {}", known.join(", "))
                },
            )
        })
    }

    /// Cached adapter for `name`, if one is connected.
    pub async fn get_adapter(&self, name: &str) -> Option<Arc<DatabaseAdapter>> {
        let adapters = self.adapters.read().await;
        adapters.get(name).and_then(|cell| cell.get().cloned())
    }

    /// Number of cached, connected adapters.
    pub async fn cached_count(&self) -> usize {
        let adapters = self.adapters.read().await;
        adapters.values().filter(|cell| cell.get().is_some()).count()
    }

    async fn cell(&self, name: &str) -> AdapterCell {
        {
            let adapters = self.adapters.read().await;
            if let Some(cell) = adapters.get(name) {
                return Arc::clone(cell);
            }
        }
        let mut adapters = self.adapters.write().await;
        // Double-check after acquiring write lock
        Arc::clone(
            adapters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Cached connected adapter for `name`, or connect to the primary.
    pub async fn create_adapter(&self, name: &str) -> DbResult<Arc<DatabaseAdapter>> {
        let config = self.config(name).await?;
        let primary = primary_endpoint(&config)?;
        let cell = self.cell(name).await;
        let adapter = cell
            .get_or_try_init(|| async {
                debug!(database = %name, "Creating adapter");
                let adapter = build_adapter(&config.name, &config, primary);
                adapter.connect().await?;
                Ok::<_, DbError>(Arc::new(adapter))
            })
            .await?;
        Ok(Arc::clone(adapter))
    }

    /// Like [`create_adapter`](Self::create_adapter), but when the primary
    /// cannot be reached each replica is tried in order. If none connects the
    /// primary's error is returned.
    pub async fn create_adapter_with_failover(
        &self,
        name: &str,
    ) -> DbResult<Arc<DatabaseAdapter>> {
        let config = self.config(name).await?;
        let primary = primary_endpoint(&config)?;
        let cell = self.cell(name).await;
        let adapter = cell
            .get_or_try_init(|| async {
                connect_with_failover(&config, primary)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(adapter))
    }

    /// Disconnect and evict the adapter for `name`. Returns whether one was
    /// cached.
    pub async fn close_adapter(&self, name: &str) -> DbResult<bool> {
        let cell = self.adapters.write().await.remove(name);
        match cell.and_then(|cell| cell.get().cloned()) {
            Some(adapter) => {
                info!(database = %name, "Closing adapter");
                adapter.disconnect().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Disconnect and evict every adapter.
    pub async fn close_all_adapters(&self) {
        // Drain under lock, close outside lock
        let drained: Vec<_> = {
            let mut adapters = self.adapters.write().await;
            adapters.drain().collect()
        };
        for (name, cell) in drained {
            if let Some(adapter) = cell.get() {
                info!(database = %name, "Closing adapter");
                if let Err(e) = adapter.disconnect().await {
                    warn!(database = %name, error = %e, "Failed to close adapter");
                }
            }
        }
    }

    async fn live_adapters(&self) -> Vec<(String, Arc<DatabaseAdapter>)> {
        let adapters = self.adapters.read().await;
        adapters
            .iter()
            .filter_map(|(name, cell)| cell.get().map(|a| (name.clone(), Arc::clone(a))))
            .collect()
    }

    /// Health of every cached adapter, checked concurrently.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let adapters = self.live_adapters().await;
        let checks = adapters.iter().map(|(name, adapter)| async move {
            (name.clone(), adapter.health_check().await)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Metrics of every cached adapter.
    pub async fn get_metrics_all(&self) -> BTreeMap<String, DatabaseMetrics> {
        let adapters = self.live_adapters().await;
        let snapshots = adapters.iter().map(|(name, adapter)| async move {
            (name.clone(), adapter.get_metrics().await)
        });
        join_all(snapshots).await.into_iter().collect()
    }
}

fn primary_endpoint(config: &DatabaseConfig) -> DbResult<ConnectionConfig> {
    if config.is_sharded() {
        return Err(DbError::unsupported(
            "create_adapter",
            format!("'{}' is sharded; route it through a shard manager", config.name),
        ));
    }
    config
        .primary
        .clone()
        .ok_or_else(|| DbError::invalid_input(format!("'{}' has no primary endpoint", config.name)))
}

async fn connect_with_failover(
    config: &DatabaseConfig,
    primary: ConnectionConfig,
) -> DbResult<DatabaseAdapter> {
    let adapter = build_adapter(&config.name, config, primary);
    let primary_error = match adapter.connect().await {
        Ok(()) => return Ok(adapter),
        Err(e) => e,
    };

    warn!(
        database = %config.name,
        error = %primary_error,
        replicas = config.replicas.len(),
        "Primary unreachable, trying replicas"
    );
    for (index, replica) in config.replicas.iter().enumerate() {
        let endpoint = replica.endpoint(config.db_type);
        let adapter = build_adapter(&config.name, config, replica.clone());
        match adapter.connect().await {
            Ok(()) => {
                info!(database = %config.name, replica = index, endpoint = %endpoint, "Failed over to replica");
                return Ok(adapter);
            }
            Err(e) => {
                warn!(database = %config.name, replica = index, endpoint = %endpoint, error = %e, "Replica unreachable");
            }
        }
    }
    Err(primary_error)
}
