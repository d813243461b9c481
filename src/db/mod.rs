//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - The adapter contract shared by every engine
//! - SQL dialect strategies and statement building
//! - Connection pools and native backends (sqlx, plus tiberius, oracle and
//!   mongodb behind features)
//! - Row decoding, schema introspection and metrics
//! - Transactions pinned to one pooled connection

#[macro_use]
pub mod macros;

pub mod adapter;
pub mod dialect;
pub mod executor;
pub mod metrics;
pub mod params;
pub mod pool;
pub mod schema;
pub mod sql;
pub mod transaction;
pub mod types;

#[cfg(feature = "mongodb")]
pub mod mongo;
#[cfg(feature = "mssql")]
pub mod mssql;
#[cfg(feature = "oracle")]
pub mod oracle;

pub use adapter::DatabaseAdapter;
pub use dialect::{
    Dialect, MySqlDialect, OracleDialect, PostgresDialect, SqlServerDialect, SqliteDialect,
    dialect_for,
};
pub use metrics::MetricsRecorder;
pub use pool::{DbPool, PoolStats};
pub use schema::SchemaInspector;
pub use sql::{SqlBuilder, Statement, validate_identifier};
pub use transaction::{DbTransaction, TransactionContext};
