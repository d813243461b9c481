//! Query execution for the sqlx-backed dialects.
//!
//! The executor uses database-specific implementations organized in
//! submodules generated by `sqlx_backend!`:
//! - `mysql`: MySQL/MariaDB
//! - `postgres`: PostgreSQL
//! - `sqlite`: SQLite
//!
//! Each submodule provides `fetch` and `execute` over a `&mut` connection,
//! so the same code serves pooled connections and open transactions.

use crate::db::dialect::Dialect;
use crate::db::types::RowToJson;
use crate::error::DbError;
use crate::models::QueryResult;
use std::time::{Duration, Instant};

/// Convert driver rows into a normalized [`QueryResult`].
pub(crate) fn process_rows<R: RowToJson>(
    rows: Vec<R>,
    dialect: &dyn Dialect,
    start: Instant,
) -> QueryResult {
    let fields = rows
        .first()
        .map(|r| r.column_names())
        .unwrap_or_default()
        .iter()
        .map(|name| dialect.normalize_field_name(name))
        .filter(|name| dialect.normalize_row(single_field(name)).contains_key(name))
        .collect();
    let json_rows = rows
        .iter()
        .map(|r| dialect.normalize_row(r.to_json_map()))
        .collect();

    QueryResult::new(fields, json_rows, start.elapsed())
}

/// One-field probe row used to ask the dialect whether a field survives
/// normalization.
fn single_field(name: &str) -> crate::models::Row {
    let mut row = crate::models::Row::new();
    row.insert(name.to_string(), serde_json::Value::Null);
    row
}

pub(crate) fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs() as u32)
}

pub(crate) mod mysql {
    sqlx_backend!(sqlx::MySqlConnection, crate::db::params::bind_mysql_param);
}

pub(crate) mod postgres {
    sqlx_backend!(sqlx::PgConnection, crate::db::params::bind_postgres_param);
}

pub(crate) mod sqlite {
    sqlx_backend!(sqlx::SqliteConnection, crate::db::params::bind_sqlite_param);
}
