//! Backend generation macros for reducing code duplication.
//!
//! The sqlx-backed dialects share identical fetch/execute logic that only
//! differs in connection type and parameter binder. `sqlx_backend!` expands
//! that logic once per backend at compile time.

/// Generate `fetch` and `execute` for one sqlx backend.
///
/// Both functions take a `&mut` connection so they serve pooled connections
/// and open transactions alike (`&mut **tx`).
///
/// # Example
///
/// ```ignore
/// pub(crate) mod postgres {
///     sqlx_backend!(sqlx::PgConnection, crate::db::params::bind_postgres_param);
/// }
/// ```
macro_rules! sqlx_backend {
    ($conn:ty, $bind:path) => {
        use std::time::{Duration, Instant};
        use tokio::time::timeout;
        use $crate::db::dialect::Dialect;
        use $crate::error::{DbError, DbResult};
        use $crate::models::{QueryParam, QueryResult};

        /// Run a statement and return its rows.
        pub async fn fetch(
            conn: &mut $conn,
            dialect: &dyn Dialect,
            sql: &str,
            params: &[QueryParam],
            query_timeout: Duration,
        ) -> DbResult<QueryResult> {
            let start = Instant::now();
            // Without params, use raw SQL to avoid prepared statement issues
            let rows_future = async {
                if params.is_empty() {
                    sqlx::Executor::fetch_all(&mut *conn, sql).await
                } else {
                    let mut query = sqlx::query(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    query.fetch_all(&mut *conn).await
                }
            };

            match timeout(query_timeout, rows_future).await {
                Ok(Ok(rows)) => Ok($crate::db::executor::process_rows(rows, dialect, start)),
                Ok(Err(e)) => Err(DbError::from(e).with_statement(sql)),
                Err(_) => Err($crate::db::executor::timeout_error(
                    "query execution",
                    query_timeout,
                )),
            }
        }

        /// Run a statement and return the affected row count.
        pub async fn execute(
            conn: &mut $conn,
            sql: &str,
            params: &[QueryParam],
            query_timeout: Duration,
        ) -> DbResult<u64> {
            let result = if params.is_empty() {
                timeout(query_timeout, sqlx::Executor::execute(&mut *conn, sql)).await
            } else {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = $bind(query, param);
                }
                timeout(query_timeout, query.execute(&mut *conn)).await
            };

            match result {
                Ok(Ok(r)) => Ok(r.rows_affected()),
                Ok(Err(e)) => Err(DbError::from(e).with_statement(sql)),
                Err(_) => Err($crate::db::executor::timeout_error(
                    "write operation",
                    query_timeout,
                )),
            }
        }
    };
}

pub(crate) use sqlx_backend;
