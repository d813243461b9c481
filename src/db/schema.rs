//! Schema introspection module.
//!
//! Every dialect's catalog query aliases its output to the same column
//! names (see [`crate::db::dialect`]), so a single parser turns any
//! dialect's rows into [`TableSchema`] and [`IndexInfo`] values.

use crate::db::dialect::Dialect;
use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use crate::models::query::{json_to_u64, json_truthy};
use crate::models::{ColumnDefinition, IndexInfo, QueryParam, QueryResult, Row, TableSchema};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::debug;

/// Schema inspector for database introspection.
pub struct SchemaInspector;

impl SchemaInspector {
    pub async fn table_exists(
        pool: &DbPool,
        dialect: &dyn Dialect,
        table: &str,
        query_timeout: Duration,
    ) -> DbResult<bool> {
        let params = [QueryParam::from(catalog_name(dialect, table))];
        let result = pool
            .fetch(&dialect.table_exists_sql(), &params, query_timeout)
            .await?;
        Ok(parse_count(&result) > 0)
    }

    /// Describe a table's columns and indexes.
    pub async fn describe_table(
        pool: &DbPool,
        dialect: &dyn Dialect,
        table: &str,
        query_timeout: Duration,
    ) -> DbResult<TableSchema> {
        let params = [QueryParam::from(catalog_name(dialect, table))];
        let columns = pool
            .fetch(&dialect.columns_sql(), &params, query_timeout)
            .await?;
        if columns.rows.is_empty() {
            return Err(DbError::schema("Table not found", table));
        }
        let indexes = Self::list_indexes(pool, dialect, table, query_timeout).await?;

        debug!(table = %table, columns = columns.row_count, indexes = indexes.len(), "Described table");
        Ok(parse_columns(table, &columns.rows).with_indexes(indexes))
    }

    pub async fn list_indexes(
        pool: &DbPool,
        dialect: &dyn Dialect,
        table: &str,
        query_timeout: Duration,
    ) -> DbResult<Vec<IndexInfo>> {
        let params = [QueryParam::from(catalog_name(dialect, table))];
        let result = pool
            .fetch(&dialect.indexes_sql(), &params, query_timeout)
            .await?;
        Ok(parse_indexes(&result.rows))
    }
}

/// Table name as stored in the catalog: schema prefix dropped, upper-case
/// for Oracle's data dictionary.
pub(crate) fn catalog_name(dialect: &dyn Dialect, table: &str) -> String {
    let name = table.rsplit('.').next().unwrap_or(table);
    match dialect.database_type() {
        crate::models::DatabaseType::Oracle => name.to_ascii_uppercase(),
        _ => name.to_string(),
    }
}

/// Read the `cnt` column of a COUNT query.
pub(crate) fn parse_count(result: &QueryResult) -> u64 {
    result
        .rows
        .first()
        .and_then(|row| row.get("cnt").or_else(|| row.values().next()))
        .and_then(json_to_u64)
        .unwrap_or(0)
}

fn text(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Build a table schema from catalog rows.
pub fn parse_columns(table: &str, rows: &[Row]) -> TableSchema {
    rows.iter()
        .filter_map(|row| {
            let name = text(row, "column_name")?.to_lowercase();
            let data_type = text(row, "data_type").unwrap_or_default().to_lowercase();
            let nullable = row.get("is_nullable").is_some_and(json_truthy);
            let mut column = ColumnDefinition::new(name, data_type, nullable)
                .with_primary_key(row.get("is_primary_key").is_some_and(json_truthy));
            if let Some(default_value) = text(row, "column_default") {
                column = column.with_default(default_value);
            }
            Some(column)
        })
        .fold(TableSchema::new(table.to_lowercase()), |schema, column| {
            schema.with_column(column)
        })
}

/// Group (index, column) catalog rows into one entry per index, keeping
/// catalog order.
pub fn parse_indexes(rows: &[Row]) -> Vec<IndexInfo> {
    let mut indexes: Vec<IndexInfo> = Vec::new();
    for row in rows {
        let (Some(name), Some(column)) = (text(row, "index_name"), text(row, "column_name")) else {
            continue;
        };
        let name = name.to_lowercase();
        let column = column.to_lowercase();
        match indexes.iter_mut().find(|idx| idx.name == name) {
            Some(index) => index.columns.push(column),
            None => {
                let is_unique = row.get("is_unique").is_some_and(json_truthy);
                let is_primary = row.get("is_primary").is_some_and(json_truthy);
                indexes.push(
                    IndexInfo::new(name, vec![column])
                        .with_unique(is_unique)
                        .with_primary(is_primary),
                );
            }
        }
    }
    indexes
}
