//! The adapter contract.
//!
//! A [`DatabaseAdapter`] owns the connection pool for one endpoint and
//! exposes the same CRUD, query, transaction, pagination, search, schema
//! and maintenance operations for every supported engine. Dialect
//! differences are resolved through [`Dialect`] and the backend modules;
//! nothing above this type branches on the engine.
//!
//! Every operation updates the adapter's [`DatabaseMetrics`]. Calls made
//! before [`DatabaseAdapter::connect`] or after
//! [`DatabaseAdapter::disconnect`] fail with [`DbError::NotConnected`].

use crate::db::dialect::Dialect;
use crate::db::metrics::MetricsRecorder;
use crate::db::pool::{DbPool, PoolStats, create_pool, dialect_of};
use crate::db::schema::{SchemaInspector, parse_count};
use crate::db::sql::{SqlBuilder, validate_identifier};
use crate::db::transaction::{TransactionContext, TransactionSettings, inserted_row};
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionConfig, DEFAULT_PRIMARY_KEY, DEFAULT_TRANSACTION_TIMEOUT_SECS, DatabaseMetrics,
    DatabaseType, IndexDefinition, IndexInfo, PageRequest, PaginatedResult, QueryParam,
    QueryResult, Row, RowUpdate, TableSchema,
};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Live connection held by a connected adapter.
#[derive(Debug, Clone)]
enum Connection {
    Sql(DbPool),
    #[cfg(feature = "mongodb")]
    Document(crate::db::mongo::MongoStore),
}

impl Connection {
    async fn close(&self) {
        match self {
            Connection::Sql(pool) => pool.close().await,
            #[cfg(feature = "mongodb")]
            Connection::Document(store) => store.close().await,
        }
    }

    async fn stats(&self) -> PoolStats {
        match self {
            Connection::Sql(pool) => pool.stats().await,
            #[cfg(feature = "mongodb")]
            Connection::Document(_) => PoolStats::default(),
        }
    }
}

/// Adapter for one database endpoint.
#[derive(Debug)]
pub struct DatabaseAdapter {
    name: String,
    db_type: DatabaseType,
    config: ConnectionConfig,
    primary_key: String,
    transaction_timeout: Duration,
    connection: RwLock<Option<Connection>>,
    metrics: Arc<MetricsRecorder>,
}

impl DatabaseAdapter {
    /// Create a disconnected adapter. `name` labels logs and errors.
    pub fn new(name: impl Into<String>, db_type: DatabaseType, config: ConnectionConfig) -> Self {
        Self {
            name: name.into(),
            db_type,
            config,
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            transaction_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            connection: RwLock::new(None),
            metrics: Arc::new(MetricsRecorder::new()),
        }
    }

    /// Column used by `find_by_id`, `update`, `delete` and search ordering.
    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }

    /// Maximum lifetime of transactions opened by this adapter.
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// SQL strategy for this adapter; `None` for MongoDB.
    pub fn dialect(&self) -> Option<&'static dyn Dialect> {
        crate::db::dialect::dialect_for(self.db_type)
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_or_default())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the pool. Connecting an already connected adapter is a no-op.
    pub async fn connect(&self) -> DbResult<()> {
        let mut guard = self.connection.write().await;
        if guard.is_some() {
            return Ok(());
        }
        self.config.validate(self.db_type).map_err(|e| {
            DbError::connection(e.to_string(), "Fix the endpoint configuration")
        })?;

        info!(
            database = %self.name,
            db_type = %self.db_type,
            endpoint = %self.config.endpoint(self.db_type),
            "Connecting to database"
        );

        let connection = match self.open().await {
            Ok(connection) => connection,
            Err(e) => {
                self.metrics.record_failure(&e.to_string());
                warn!(database = %self.name, error = %e, "Connection failed");
                return Err(e);
            }
        };
        *guard = Some(connection);
        info!(database = %self.name, "Connected");
        Ok(())
    }

    async fn open(&self) -> DbResult<Connection> {
        match self.db_type {
            #[cfg(feature = "mongodb")]
            DatabaseType::MongoDB => Ok(Connection::Document(
                crate::db::mongo::MongoStore::connect(&self.config).await?,
            )),
            db_type => Ok(Connection::Sql(create_pool(db_type, &self.config).await?)),
        }
    }

    /// Close the pool. Disconnecting a disconnected adapter is a no-op.
    pub async fn disconnect(&self) -> DbResult<()> {
        let connection = self.connection.write().await.take();
        if let Some(connection) = connection {
            connection.close().await;
            info!(database = %self.name, "Disconnected");
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    async fn connection(&self) -> DbResult<Connection> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| DbError::not_connected(&self.name))
    }

    /// Run one operation against the live connection and record it.
    async fn run<T, F, Fut>(&self, operation: &str, work: F) -> DbResult<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let start = Instant::now();
        let result = match self.connection().await {
            Ok(connection) => work(connection).await,
            Err(e) => Err(e),
        };
        self.metrics.record(start, &result);
        if let Err(e) = &result {
            debug!(database = %self.name, operation = %operation, error = %e, "Operation failed");
        }
        result
    }

    /// Round-trip to the server. Never fails; errors count as unhealthy.
    pub async fn health_check(&self) -> bool {
        let timeout = self.query_timeout();
        let result = self
            .run("health_check", |connection| async move {
                match connection {
                    Connection::Sql(pool) => pool
                        .fetch(dialect_of(&pool).health_check_sql(), &[], timeout)
                        .await
                        .map(|_| ()),
                    #[cfg(feature = "mongodb")]
                    Connection::Document(store) => store.ping().await,
                }
            })
            .await;
        if let Err(e) = &result {
            warn!(database = %self.name, error = %e, "Health check failed");
        }
        result.is_ok()
    }

    // =========================================================================
    // Raw statements
    // =========================================================================

    /// Run a row-returning statement. MongoDB takes a JSON command document.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let timeout = self.query_timeout();
        self.run("query", |connection| async move {
            match connection {
                Connection::Sql(pool) => pool.fetch(sql, params, timeout).await,
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.command(sql, timeout).await,
            }
        })
        .await
    }

    /// Run a statement and return the affected row count.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let timeout = self.query_timeout();
        self.run("execute", |connection| async move {
            match connection {
                Connection::Sql(pool) => pool.execute(sql, params, timeout).await,
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.command_count(sql, timeout).await,
            }
        })
        .await
    }

    /// Pin one pooled connection and start a native transaction on it.
    pub async fn begin_transaction(&self) -> DbResult<TransactionContext> {
        let settings = TransactionSettings {
            database: self.name.clone(),
            primary_key: self.primary_key.clone(),
            max_lifetime: self.transaction_timeout,
            query_timeout: self.query_timeout(),
        };
        let inner = self
            .run("begin_transaction", |connection| async move {
                match connection {
                    Connection::Sql(pool) => pool.begin().await,
                    #[cfg(feature = "mongodb")]
                    Connection::Document(store) => Ok(
                        crate::db::transaction::DbTransaction::MongoDB(store.begin().await?),
                    ),
                }
            })
            .await?;
        Ok(TransactionContext::new(inner, settings, self.metrics.clone()))
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Insert one record. Returns the stored row where the dialect can
    /// report it (RETURNING / OUTPUT), otherwise the record as given.
    pub async fn insert(&self, table: &str, record: &Row) -> DbResult<Row> {
        let timeout = self.query_timeout();
        self.run("insert", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    let statement = SqlBuilder::new(dialect_of(&pool)).insert(table, record)?;
                    let result = pool.fetch(&statement.sql, &statement.params, timeout).await?;
                    Ok(inserted_row(result, record))
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.insert(table, record).await,
            }
        })
        .await
    }

    /// Update the row whose primary key is `id`. Returns the affected count.
    pub async fn update(&self, table: &str, id: &JsonValue, changes: &Row) -> DbResult<u64> {
        let timeout = self.query_timeout();
        let key = self.primary_key.as_str();
        self.run("update", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    let statement =
                        SqlBuilder::new(dialect_of(&pool)).update(table, key, id, changes)?;
                    pool.execute(&statement.sql, &statement.params, timeout).await
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.update(table, key, id, changes).await,
            }
        })
        .await
    }

    pub async fn delete(&self, table: &str, id: &JsonValue) -> DbResult<u64> {
        let timeout = self.query_timeout();
        let key = self.primary_key.as_str();
        self.run("delete", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    let statement = SqlBuilder::new(dialect_of(&pool)).delete(table, key, id)?;
                    pool.execute(&statement.sql, &statement.params, timeout).await
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.delete(table, key, id).await,
            }
        })
        .await
    }

    pub async fn find_by_id(&self, table: &str, id: &JsonValue) -> DbResult<Option<Row>> {
        let key = self.primary_key.clone();
        Ok(self
            .find_by_field(table, &key, id)
            .await?
            .into_iter()
            .next())
    }

    /// All rows whose `field` equals `value` (`IS NULL` for null).
    pub async fn find_by_field(
        &self,
        table: &str,
        field: &str,
        value: &JsonValue,
    ) -> DbResult<Vec<Row>> {
        let timeout = self.query_timeout();
        self.run("find_by_field", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    let statement =
                        SqlBuilder::new(dialect_of(&pool)).select_where(table, field, value)?;
                    Ok(pool
                        .fetch(&statement.sql, &statement.params, timeout)
                        .await?
                        .rows)
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.find_by_field(table, field, value).await,
            }
        })
        .await
    }

    /// Insert many records with multi-row INSERTs. When the batch needs more
    /// than one statement, all of them run in one transaction.
    pub async fn bulk_insert(&self, table: &str, records: &[Row]) -> DbResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        #[cfg(feature = "mongodb")]
        if let Connection::Document(store) = self.connection().await? {
            let start = Instant::now();
            let result = store.bulk_insert(table, records).await;
            self.metrics.record(start, &result);
            return result;
        }

        let dialect = self.dialect().ok_or_else(|| {
            DbError::unsupported("bulk_insert", format!("{} has no SQL dialect", self.db_type))
        })?;
        let statements = SqlBuilder::new(dialect).bulk_insert(table, records)?;
        if let [statement] = statements.as_slice() {
            return self.execute(&statement.sql, &statement.params).await;
        }

        debug!(database = %self.name, table = %table, chunks = statements.len(), "Chunked bulk insert");
        let mut tx = self.begin_transaction().await?;
        let mut inserted = 0;
        for statement in &statements {
            match tx.execute(&statement.sql, &statement.params).await {
                Ok(count) => inserted += count,
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "Rollback after failed bulk insert failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Apply each update in one transaction. Any failure rolls back every
    /// update applied by this call.
    pub async fn bulk_update(&self, table: &str, updates: &[RowUpdate]) -> DbResult<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        let mut tx = self.begin_transaction().await?;
        let mut affected = 0;
        for update in updates {
            match tx.update(table, &update.id, &update.changes).await {
                Ok(count) => affected += count,
                Err(e) => {
                    warn!(database = %self.name, table = %table, error = %e, "Bulk update failed, rolling back");
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "Rollback after failed bulk update failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await?;
        Ok(affected)
    }

    // =========================================================================
    // Pagination and search
    // =========================================================================

    /// One page of `table` under equality filters.
    pub async fn paginate(&self, table: &str, request: &PageRequest) -> DbResult<PaginatedResult> {
        request.validate().map_err(DbError::invalid_input)?;
        let (total, data) = self
            .count_and_window(table, request, request.limit, request.offset())
            .await?;
        Ok(PaginatedResult::new(
            data,
            total,
            request.page,
            request.limit,
        ))
    }

    /// Filtered row count plus an ordered window of `limit` rows at `offset`.
    pub async fn count_and_window(
        &self,
        table: &str,
        request: &PageRequest,
        limit: u64,
        offset: u64,
    ) -> DbResult<(u64, Vec<Row>)> {
        let timeout = self.query_timeout();
        self.run("paginate", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    let builder = SqlBuilder::new(dialect_of(&pool));
                    let count = builder.count(table, request)?;
                    let page = builder.page(table, request, limit, offset)?;
                    let total = parse_count(&pool.fetch(&count.sql, &count.params, timeout).await?);
                    let rows = pool.fetch(&page.sql, &page.params, timeout).await?.rows;
                    Ok((total, rows))
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => {
                    store.count_and_window(table, request, limit, offset).await
                }
            }
        })
        .await
    }

    /// Case-insensitive match of `term` in any of `fields`, at most `limit`
    /// rows, ordered by primary key ascending.
    pub async fn search(
        &self,
        table: &str,
        fields: &[String],
        term: &str,
        limit: u64,
    ) -> DbResult<Vec<Row>> {
        let timeout = self.query_timeout();
        let key = self.primary_key.as_str();
        self.run("search", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    let statement =
                        SqlBuilder::new(dialect_of(&pool)).search(table, fields, term, key, limit)?;
                    Ok(pool
                        .fetch(&statement.sql, &statement.params, timeout)
                        .await?
                        .rows)
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.search(table, fields, term, key, limit).await,
            }
        })
        .await
    }

    // =========================================================================
    // Schema
    // =========================================================================

    pub async fn table_exists(&self, table: &str) -> DbResult<bool> {
        let timeout = self.query_timeout();
        self.run("table_exists", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    validate_identifier(table)?;
                    SchemaInspector::table_exists(&pool, dialect_of(&pool), table, timeout).await
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.table_exists(table).await,
            }
        })
        .await
    }

    pub async fn get_table_schema(&self, table: &str) -> DbResult<TableSchema> {
        let timeout = self.query_timeout();
        self.run("get_table_schema", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    validate_identifier(table)?;
                    SchemaInspector::describe_table(&pool, dialect_of(&pool), table, timeout).await
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.describe(table).await,
            }
        })
        .await
    }

    pub async fn create_index(&self, table: &str, index: &IndexDefinition) -> DbResult<()> {
        let timeout = self.query_timeout();
        self.run("create_index", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    let sql = SqlBuilder::new(dialect_of(&pool)).create_index(table, index)?;
                    pool.execute(&sql, &[], timeout).await.map(|_| ())
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.create_index(table, index).await,
            }
        })
        .await
    }

    pub async fn list_indexes(&self, table: &str) -> DbResult<Vec<IndexInfo>> {
        let timeout = self.query_timeout();
        self.run("list_indexes", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    validate_identifier(table)?;
                    SchemaInspector::list_indexes(&pool, dialect_of(&pool), table, timeout).await
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.list_indexes(table).await,
            }
        })
        .await
    }

    // =========================================================================
    // Introspection and maintenance
    // =========================================================================

    /// Metrics snapshot; connection counters come from the live pool.
    pub async fn get_metrics(&self) -> DatabaseMetrics {
        let stats = match self.connection.read().await.as_ref() {
            Some(connection) => connection.stats().await,
            None => PoolStats::default(),
        };
        self.metrics.snapshot(stats)
    }

    /// Server version string.
    pub async fn version(&self) -> DbResult<String> {
        let timeout = self.query_timeout();
        self.run("version", |connection| async move {
            match connection {
                Connection::Sql(pool) => {
                    let result = pool
                        .fetch(dialect_of(&pool).version_sql(), &[], timeout)
                        .await?;
                    Ok(match result.scalar() {
                        Some(JsonValue::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::from("unknown"),
                    })
                }
                #[cfg(feature = "mongodb")]
                Connection::Document(store) => store.version().await,
            }
        })
        .await
    }

    /// Write a backup of the database to `path`.
    ///
    /// Only engines with a native backup statement support this; the others
    /// fail with [`DbError::UnsupportedOperation`] naming the external tool.
    pub async fn backup(&self, path: &Path) -> DbResult<()> {
        let dialect = self.require_native_maintenance("backup")?;
        let sql = dialect
            .backup_sql(&self.config.database)
            .ok_or_else(|| self.external_tool_error("backup", dialect))?;
        info!(database = %self.name, path = %path.display(), "Starting backup");
        let target = QueryParam::String(path.to_string_lossy().into_owned());
        self.execute(&sql, &[target]).await?;
        info!(database = %self.name, "Backup complete");
        Ok(())
    }

    /// Restore the database from a backup at `path`.
    ///
    /// SQLite restores by replacing the database file while the pool is
    /// closed, so the adapter reconnects afterwards.
    pub async fn restore(&self, path: &Path) -> DbResult<()> {
        let dialect = self.require_native_maintenance("restore")?;
        info!(database = %self.name, path = %path.display(), "Starting restore");

        if self.db_type == DatabaseType::SQLite {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(DbError::invalid_input(format!(
                    "Backup file '{}' does not exist",
                    path.display()
                )));
            }
            let was_connected = self.is_connected().await;
            self.disconnect().await?;
            let copied = tokio::fs::copy(path, &self.config.database)
                .await
                .map_err(|e| DbError::internal(format!("Failed to restore SQLite file: {}", e)));
            if was_connected {
                self.connect().await?;
            }
            copied?;
        } else {
            let sql = dialect
                .restore_sql(&self.config.database)
                .ok_or_else(|| self.external_tool_error("restore", dialect))?;
            let source = QueryParam::String(path.to_string_lossy().into_owned());
            self.execute(&sql, &[source]).await?;
        }
        info!(database = %self.name, "Restore complete");
        Ok(())
    }

    fn require_native_maintenance(&self, operation: &str) -> DbResult<&'static dyn Dialect> {
        self.dialect().ok_or_else(|| {
            DbError::unsupported(
                operation,
                format!("{} requires an external tool: mongodump / mongorestore", self.db_type),
            )
        })
    }

    fn external_tool_error(&self, operation: &str, dialect: &dyn Dialect) -> DbError {
        DbError::unsupported(
            operation,
            format!(
                "{} requires an external tool: {}",
                self.db_type,
                dialect.backup_tool()
            ),
        )
    }
}
