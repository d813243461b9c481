//! Oracle backend (feature `oracle`).
//!
//! The oracle crate is blocking (ODPI-C), so every call runs on tokio's
//! blocking pool. Sessions come from the driver's own session pool.

use crate::db::dialect::{Dialect, OracleDialect};
use crate::db::executor::{process_rows, timeout_error};
use crate::db::pool::{PoolStats, connection_suggestion};
use crate::db::types::{RowToJson, decode_binary_value, float_value};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType, QueryParam, QueryResult, Row};
use oracle::pool::{CloseMode, PoolBuilder};
use oracle::sql_type::{OracleType, ToSql};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type OwnedParam = Box<dyn ToSql + Send + Sync>;

#[derive(Clone)]
pub struct OraclePool {
    pool: Arc<oracle::pool::Pool>,
}

impl std::fmt::Debug for OraclePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OraclePool").finish_non_exhaustive()
    }
}

/// Run blocking driver work off the async runtime.
async fn blocking<T, F>(work: F) -> DbResult<T>
where
    F: FnOnce() -> DbResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DbError::internal(format!("Oracle worker failed: {}", e)))?
}

/// Run blocking driver work with a deadline.
async fn blocking_with_timeout<T, F>(operation: &str, limit: Duration, work: F) -> DbResult<T>
where
    F: FnOnce() -> DbResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, blocking(work)).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error(operation, limit)),
    }
}

impl OraclePool {
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        let username = config.username.clone().unwrap_or_default();
        let password = config.password.clone().unwrap_or_default();
        let connect_string = format!(
            "//{}:{}/{}",
            config.host,
            config.port_or_default(DatabaseType::Oracle),
            config.database
        );
        let max = config.pool_size_or_default(DatabaseType::Oracle);
        info!(endpoint = %config.endpoint(DatabaseType::Oracle), pool_size = max, "Creating Oracle session pool");

        let pool = blocking(move || {
            let pool = PoolBuilder::new(username, password, connect_string)
                .min_connections(0)
                .max_connections(max)
                .build()
                .map_err(|e| {
                    let message = e.to_string();
                    DbError::connection(
                        format!("Failed to connect: {}", message),
                        connection_suggestion(DatabaseType::Oracle, &message),
                    )
                })?;
            // Verify credentials with one session.
            pool.get().map_err(|e| {
                let message = e.to_string();
                DbError::connection(
                    format!("Failed to connect: {}", message),
                    connection_suggestion(DatabaseType::Oracle, &message),
                )
            })?;
            Ok(pool)
        })
        .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn close(&self) {
        let pool = self.pool.clone();
        if let Err(e) = blocking(move || Ok(pool.close(&CloseMode::Default)?)).await {
            warn!(error = %e, "Failed to close Oracle session pool");
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.open_count().unwrap_or(0),
            idle: self
                .pool
                .open_count()
                .unwrap_or(0)
                .saturating_sub(self.pool.busy_count().unwrap_or(0)),
        }
    }

    async fn session(&self) -> DbResult<Arc<oracle::Connection>> {
        let pool = self.pool.clone();
        blocking(move || Ok(Arc::new(pool.get()?))).await
    }

    pub async fn fetch(
        &self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<QueryResult> {
        let conn = self.session().await?;
        fetch(conn, sql, params, query_timeout).await
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let conn = self.session().await?;
        let affected = execute(conn.clone(), sql, params, query_timeout).await?;
        blocking(move || Ok(conn.commit()?)).await?;
        Ok(affected)
    }

    pub async fn begin(&self) -> DbResult<OracleTransaction> {
        let conn = self.session().await?;
        // Oracle opens a transaction implicitly with the first DML.
        debug!("Oracle transaction pinned to session");
        Ok(OracleTransaction { conn })
    }
}

pub struct OracleTransaction {
    conn: Arc<oracle::Connection>,
}

impl OracleTransaction {
    pub async fn fetch(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<QueryResult> {
        fetch(self.conn.clone(), sql, params, query_timeout).await
    }

    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        execute(self.conn.clone(), sql, params, query_timeout).await
    }

    pub async fn commit(self) -> DbResult<()> {
        let conn = self.conn;
        blocking(move || Ok(conn.commit()?)).await
    }

    pub async fn rollback(self) -> DbResult<()> {
        let conn = self.conn;
        blocking(move || Ok(conn.rollback()?)).await
    }
}

fn owned_params(params: &[QueryParam]) -> Vec<OwnedParam> {
    params
        .iter()
        .map(|param| -> OwnedParam {
            match param {
                QueryParam::Null => Box::new(Option::<String>::None),
                // No SQL BOOLEAN before 23c
                QueryParam::Bool(v) => Box::new(i64::from(*v)),
                QueryParam::Int(v) => Box::new(*v),
                QueryParam::Float(v) => Box::new(*v),
                QueryParam::String(v) => Box::new(v.clone()),
                QueryParam::Json(v) => Box::new(v.to_string()),
                QueryParam::Bytes(v) => Box::new(v.clone()),
            }
        })
        .collect()
}

async fn fetch(
    conn: Arc<oracle::Connection>,
    sql: &str,
    params: &[QueryParam],
    query_timeout: Duration,
) -> DbResult<QueryResult> {
    let start = Instant::now();
    let owned = owned_params(params);
    let statement = sql.to_string();
    let rows = blocking_with_timeout("query execution", query_timeout, move || {
        let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref() as &dyn ToSql).collect();
        let rows = conn
            .query(&statement, &refs)
            .map_err(|e| DbError::from(e).with_statement(&statement))?;
        rows.map(|row| {
            row.map(OracleRow::from)
                .map_err(|e| DbError::from(e).with_statement(&statement))
        })
        .collect::<DbResult<Vec<_>>>()
    })
    .await?;
    Ok(process_rows(rows, &OracleDialect as &dyn Dialect, start))
}

async fn execute(
    conn: Arc<oracle::Connection>,
    sql: &str,
    params: &[QueryParam],
    query_timeout: Duration,
) -> DbResult<u64> {
    let owned = owned_params(params);
    let statement = sql.to_string();
    blocking_with_timeout("write operation", query_timeout, move || {
        let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref() as &dyn ToSql).collect();
        let stmt = conn
            .execute(&statement, &refs)
            .map_err(|e| DbError::from(e).with_statement(&statement))?;
        Ok(stmt.row_count()?)
    })
    .await
}

/// Oracle row decoded eagerly on the blocking thread.
struct OracleRow {
    names: Vec<String>,
    values: Vec<JsonValue>,
}

impl From<oracle::Row> for OracleRow {
    fn from(row: oracle::Row) -> Self {
        let names = row
            .column_info()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let values = row
            .column_info()
            .iter()
            .enumerate()
            .map(|(idx, info)| decode_value(&row, idx, info.oracle_type()))
            .collect();
        Self { names, values }
    }
}

impl RowToJson for OracleRow {
    fn to_json_map(&self) -> Row {
        self.names
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }

    fn column_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

fn decode_value(row: &oracle::Row, idx: usize, oracle_type: &OracleType) -> JsonValue {
    match oracle_type {
        OracleType::Number(_, 0) | OracleType::Int64 => match row.get::<usize, Option<i64>>(idx) {
            Ok(Some(v)) => JsonValue::from(v),
            Ok(None) => JsonValue::Null,
            // Integers wider than i64 keep their text form
            Err(_) => text(row, idx),
        },
        OracleType::BinaryFloat | OracleType::BinaryDouble | OracleType::Float(_) => {
            match row.get::<usize, Option<f64>>(idx) {
                Ok(Some(v)) => float_value(v),
                _ => JsonValue::Null,
            }
        }
        OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => {
            match row.get::<usize, Option<Vec<u8>>>(idx) {
                Ok(Some(v)) => decode_binary_value(&v, false),
                _ => JsonValue::Null,
            }
        }
        _ => text(row, idx),
    }
}

fn text(row: &oracle::Row, idx: usize) -> JsonValue {
    match row.get::<usize, Option<String>>(idx) {
        Ok(Some(v)) => JsonValue::String(v),
        _ => JsonValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_params_maps_bool_to_number() {
        let params = owned_params(&[QueryParam::Bool(true), QueryParam::Null]);
        assert_eq!(params.len(), 2);
    }
}
