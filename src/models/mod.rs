//! Data models for unidb.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod metrics;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{
    ConnectionConfig, ConnectionConfigError, DEFAULT_POOL_SIZE, DEFAULT_POOL_SIZE_SQLITE,
    DEFAULT_PRIMARY_KEY, DEFAULT_TIMEOUT_SECS, DEFAULT_TRANSACTION_TIMEOUT_SECS, DatabaseConfig,
    DatabaseType, ShardingSpec,
};
pub use metrics::{DatabaseHealth, DatabaseKind, DatabaseMetrics, HealthReport};
pub use query::{
    DEFAULT_ORDER_BY, MAX_PAGE_LIMIT, PageRequest, PaginatedResult, QueryParam, QueryResult, Row,
    RowUpdate, SortDirection,
};
pub use schema::{ColumnDefinition, IndexDefinition, IndexInfo, TableSchema};
