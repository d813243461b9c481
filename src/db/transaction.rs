//! Transactions pinned to one pooled connection.
//!
//! A [`TransactionContext`] owns its native transaction exclusively. It must
//! be committed or rolled back exactly once; a second attempt is a
//! [`DbError::TransactionState`]. Each context carries a maximum lifetime:
//! the first use after it expires rolls the transaction back and fails.
//! Dropping an open context rolls it back.

use crate::db::dialect::{Dialect, MySqlDialect, PostgresDialect, SqliteDialect};
use crate::db::executor;
use crate::db::metrics::MetricsRecorder;
use crate::db::sql::{SqlBuilder, Statement};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, QueryResult, Row};
use serde_json::Value as JsonValue;
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Database-specific transaction wrapper.
///
/// This enum wraps database-specific transaction types to provide
/// a unified interface for transaction management.
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
    #[cfg(feature = "mssql")]
    SqlServer(crate::db::mssql::MssqlTransaction),
    #[cfg(feature = "oracle")]
    Oracle(crate::db::oracle::OracleTransaction),
    #[cfg(feature = "mongodb")]
    MongoDB(crate::db::mongo::MongoTransaction),
}

impl DbTransaction {
    /// Get the database type for this transaction.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySQL,
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
            #[cfg(feature = "mssql")]
            DbTransaction::SqlServer(_) => DatabaseType::SqlServer,
            #[cfg(feature = "oracle")]
            DbTransaction::Oracle(_) => DatabaseType::Oracle,
            #[cfg(feature = "mongodb")]
            DbTransaction::MongoDB(_) => DatabaseType::MongoDB,
        }
    }

    /// SQL strategy for this transaction, `None` for document stores.
    pub fn dialect(&self) -> Option<&'static dyn Dialect> {
        crate::db::dialect::dialect_for(self.db_type())
    }

    pub async fn fetch(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<QueryResult> {
        match self {
            DbTransaction::MySql(tx) => {
                executor::mysql::fetch(&mut **tx, &MySqlDialect, sql, params, query_timeout).await
            }
            DbTransaction::Postgres(tx) => {
                executor::postgres::fetch(&mut **tx, &PostgresDialect, sql, params, query_timeout)
                    .await
            }
            DbTransaction::SQLite(tx) => {
                executor::sqlite::fetch(&mut **tx, &SqliteDialect, sql, params, query_timeout)
                    .await
            }
            #[cfg(feature = "mssql")]
            DbTransaction::SqlServer(tx) => tx.fetch(sql, params, query_timeout).await,
            #[cfg(feature = "oracle")]
            DbTransaction::Oracle(tx) => tx.fetch(sql, params, query_timeout).await,
            #[cfg(feature = "mongodb")]
            DbTransaction::MongoDB(tx) => tx.command(sql, query_timeout).await,
        }
    }

    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        match self {
            DbTransaction::MySql(tx) => {
                executor::mysql::execute(&mut **tx, sql, params, query_timeout).await
            }
            DbTransaction::Postgres(tx) => {
                executor::postgres::execute(&mut **tx, sql, params, query_timeout).await
            }
            DbTransaction::SQLite(tx) => {
                executor::sqlite::execute(&mut **tx, sql, params, query_timeout).await
            }
            #[cfg(feature = "mssql")]
            DbTransaction::SqlServer(tx) => tx.execute(sql, params, query_timeout).await,
            #[cfg(feature = "oracle")]
            DbTransaction::Oracle(tx) => tx.execute(sql, params, query_timeout).await,
            #[cfg(feature = "mongodb")]
            DbTransaction::MongoDB(tx) => tx.command_count(sql, query_timeout).await,
        }
    }

    /// Commit the transaction.
    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.commit().await.map_err(DbError::from),
            #[cfg(feature = "mssql")]
            DbTransaction::SqlServer(tx) => tx.commit().await,
            #[cfg(feature = "oracle")]
            DbTransaction::Oracle(tx) => tx.commit().await,
            #[cfg(feature = "mongodb")]
            DbTransaction::MongoDB(tx) => tx.commit().await,
        }
    }

    /// Rollback the transaction.
    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.rollback().await.map_err(DbError::from),
            #[cfg(feature = "mssql")]
            DbTransaction::SqlServer(tx) => tx.rollback().await,
            #[cfg(feature = "oracle")]
            DbTransaction::Oracle(tx) => tx.rollback().await,
            #[cfg(feature = "mongodb")]
            DbTransaction::MongoDB(tx) => tx.rollback().await,
        }
    }
}

/// Settings a context inherits from the adapter that opened it.
#[derive(Debug, Clone)]
pub(crate) struct TransactionSettings {
    pub database: String,
    pub primary_key: String,
    pub max_lifetime: Duration,
    pub query_timeout: Duration,
}

/// Handle to an open transaction.
pub struct TransactionContext {
    id: String,
    inner: Option<DbTransaction>,
    settings: TransactionSettings,
    started: Instant,
    metrics: Arc<MetricsRecorder>,
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("database", &self.settings.database)
            .field("active", &self.inner.is_some())
            .field("elapsed", &self.started.elapsed())
            .finish()
    }
}

impl TransactionContext {
    pub(crate) fn new(
        inner: DbTransaction,
        settings: TransactionSettings,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        info!(
            transaction_id = %id,
            database = %settings.database,
            db_type = %inner.db_type(),
            max_lifetime_secs = settings.max_lifetime.as_secs(),
            "Transaction started"
        );
        Self {
            id,
            inner: Some(inner),
            settings,
            started: Instant::now(),
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn database(&self) -> &str {
        &self.settings.database
    }

    /// True until commit or rollback.
    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    pub fn is_expired(&self) -> bool {
        self.started.elapsed() > self.settings.max_lifetime
    }

    /// The open native transaction, rolling it back first if it outlived
    /// its maximum lifetime.
    async fn live(&mut self) -> DbResult<&mut DbTransaction> {
        if self.inner.is_some() && self.is_expired() {
            if let Some(tx) = self.inner.take() {
                warn!(
                    transaction_id = %self.id,
                    elapsed_secs = self.started.elapsed().as_secs(),
                    "Transaction exceeded its maximum lifetime, rolling back"
                );
                if let Err(e) = tx.rollback().await {
                    warn!(transaction_id = %self.id, error = %e, "Rollback of expired transaction failed");
                }
            }
            return Err(DbError::transaction_state(
                format!(
                    "Transaction exceeded its maximum lifetime of {}s and was rolled back",
                    self.settings.max_lifetime.as_secs()
                ),
                self.id.clone(),
            ));
        }
        match self.inner.as_mut() {
            Some(tx) => Ok(tx),
            None => Err(DbError::transaction_state(
                "Transaction already committed or rolled back",
                self.id.clone(),
            )),
        }
    }

    async fn builder(&mut self) -> DbResult<SqlBuilder> {
        let tx = self.live().await?;
        tx.dialect().map(SqlBuilder::new).ok_or_else(|| {
            DbError::unsupported("SQL statement building", "Document stores take commands")
        })
    }

    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let start = Instant::now();
        let query_timeout = self.settings.query_timeout;
        let result = match self.live().await {
            Ok(tx) => tx.fetch(sql, params, query_timeout).await,
            Err(e) => Err(e),
        };
        self.metrics.record(start, &result);
        result
    }

    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let start = Instant::now();
        let query_timeout = self.settings.query_timeout;
        let result = match self.live().await {
            Ok(tx) => tx.execute(sql, params, query_timeout).await,
            Err(e) => Err(e),
        };
        self.metrics.record(start, &result);
        result
    }

    async fn fetch_statement(&mut self, statement: &Statement) -> DbResult<QueryResult> {
        self.query(&statement.sql, &statement.params).await
    }

    /// Insert a record and return the stored row when the dialect reports
    /// it, otherwise the record as given.
    pub async fn insert(&mut self, table: &str, record: &Row) -> DbResult<Row> {
        #[cfg(feature = "mongodb")]
        if let DbTransaction::MongoDB(tx) = self.live().await? {
            let start = Instant::now();
            let result = tx.insert(table, record).await;
            self.metrics.record(start, &result);
            return result;
        }
        let statement = self.builder().await?.insert(table, record)?;
        let result = self.fetch_statement(&statement).await?;
        Ok(inserted_row(result, record))
    }

    pub async fn update(&mut self, table: &str, id: &JsonValue, changes: &Row) -> DbResult<u64> {
        let key = self.settings.primary_key.clone();
        #[cfg(feature = "mongodb")]
        if let DbTransaction::MongoDB(tx) = self.live().await? {
            let start = Instant::now();
            let result = tx.update(table, &key, id, changes).await;
            self.metrics.record(start, &result);
            return result;
        }
        let statement = self.builder().await?.update(table, &key, id, changes)?;
        self.execute(&statement.sql, &statement.params).await
    }

    pub async fn delete(&mut self, table: &str, id: &JsonValue) -> DbResult<u64> {
        let key = self.settings.primary_key.clone();
        #[cfg(feature = "mongodb")]
        if let DbTransaction::MongoDB(tx) = self.live().await? {
            let start = Instant::now();
            let result = tx.delete(table, &key, id).await;
            self.metrics.record(start, &result);
            return result;
        }
        let statement = self.builder().await?.delete(table, &key, id)?;
        self.execute(&statement.sql, &statement.params).await
    }

    pub async fn find_by_id(&mut self, table: &str, id: &JsonValue) -> DbResult<Option<Row>> {
        let key = self.settings.primary_key.clone();
        #[cfg(feature = "mongodb")]
        if let DbTransaction::MongoDB(tx) = self.live().await? {
            let start = Instant::now();
            let result = tx.find_one(table, &key, id).await;
            self.metrics.record(start, &result);
            return result;
        }
        let statement = self.builder().await?.select_where(table, &key, id)?;
        let result = self.fetch_statement(&statement).await?;
        Ok(result.rows.into_iter().next())
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        let tx = self.take_live().await?;
        tx.commit().await?;
        debug!(transaction_id = %self.id, elapsed_ms = self.started.elapsed().as_millis() as u64, "Transaction committed");
        Ok(())
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        let tx = self.take_live().await?;
        tx.rollback().await?;
        debug!(transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }

    async fn take_live(&mut self) -> DbResult<DbTransaction> {
        self.live().await?;
        self.inner.take().ok_or_else(|| {
            DbError::transaction_state(
                "Transaction already committed or rolled back",
                self.id.clone(),
            )
        })
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        let Some(tx) = self.inner.take() else {
            return;
        };
        warn!(transaction_id = %self.id, "Transaction dropped while open, rolling back");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let id = self.id.clone();
                handle.spawn(async move {
                    if let Err(e) = tx.rollback().await {
                        warn!(transaction_id = %id, error = %e, "Rollback on drop failed");
                    }
                });
            }
            // Without a runtime the native transaction's own drop handles it.
            Err(_) => drop(tx),
        }
    }
}

/// Row returned by an INSERT, or the submitted record when the dialect has
/// no RETURNING/OUTPUT support.
pub(crate) fn inserted_row(result: QueryResult, record: &Row) -> Row {
    result
        .rows
        .into_iter()
        .next()
        .unwrap_or_else(|| record.clone())
}
