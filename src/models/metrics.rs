//! Metrics and health report models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time metrics for one adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseMetrics {
    /// Connections currently checked out of the pool.
    pub active_connections: u32,
    /// Connections currently open (idle + active).
    pub total_connections: u32,
    pub query_count: u64,
    /// Rolling average latency in milliseconds.
    pub average_query_time: f64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// Whether a logical database is served by one adapter or a shard set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Single,
    Sharded,
}

/// Health of one logical database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub kind: DatabaseKind,
    /// True only when every shard (or the single adapter) is healthy.
    pub healthy: bool,
    /// Per-shard health; empty for single databases.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shards: BTreeMap<String, bool>,
    /// Metrics per adapter: the logical name itself, or each shard id.
    #[serde(default)]
    pub metrics: BTreeMap<String, DatabaseMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health of every configured database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub databases: BTreeMap<String, DatabaseHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(databases: BTreeMap<String, DatabaseHealth>) -> Self {
        Self {
            healthy: databases.values().all(|d| d.healthy),
            databases,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_json_shape() {
        let metrics = DatabaseMetrics {
            active_connections: 1,
            total_connections: 4,
            query_count: 10,
            average_query_time: 2.5,
            error_count: 1,
            last_error: Some("boom".to_string()),
        };
        let value = serde_json::to_value(&metrics).unwrap();
        for key in [
            "activeConnections",
            "totalConnections",
            "queryCount",
            "averageQueryTime",
            "errorCount",
            "lastError",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_health_report_overall_flag() {
        let mut databases = BTreeMap::new();
        databases.insert(
            "a".to_string(),
            DatabaseHealth {
                kind: DatabaseKind::Single,
                healthy: true,
                shards: BTreeMap::new(),
                metrics: BTreeMap::new(),
                error: None,
            },
        );
        assert!(HealthReport::new(databases.clone()).healthy);

        databases.insert(
            "b".to_string(),
            DatabaseHealth {
                kind: DatabaseKind::Sharded,
                healthy: false,
                shards: BTreeMap::from([("s1".to_string(), false)]),
                metrics: BTreeMap::from([("s1".to_string(), DatabaseMetrics::default())]),
                error: None,
            },
        );
        assert!(!HealthReport::new(databases).healthy);
    }
}
