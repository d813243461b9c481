//! unidb library
//!
//! One uniform CRUD, query and transaction API over PostgreSQL, MySQL,
//! SQLite, SQL Server, Oracle and MongoDB, with replica failover and
//! transparent hash sharding.
//!
//! - [`db::DatabaseAdapter`]: the per-endpoint contract
//! - [`AdapterFactory`]: cached adapters, failover, health fan-out
//! - [`ShardManager`]: key routing, replication, cross-shard queries
//! - [`UnifiedDatabaseService`]: the façade routing by logical name

pub mod config;
pub mod db;
pub mod error;
pub mod factory;
pub mod models;
pub mod service;
pub mod shard;

pub use error::{DbError, DbResult};
pub use factory::AdapterFactory;
pub use service::UnifiedDatabaseService;
pub use shard::ShardManager;
