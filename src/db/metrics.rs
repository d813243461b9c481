//! Per-adapter operation metrics.

use crate::db::pool::PoolStats;
use crate::error::DbResult;
use crate::models::DatabaseMetrics;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of recent operations averaged for `averageQueryTime`.
pub const LATENCY_WINDOW: usize = 100;

/// Lock-light recorder shared by an adapter and the transactions it opens.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    query_count: AtomicU64,
    error_count: AtomicU64,
    latencies: Mutex<VecDeque<f64>>,
    last_error: Mutex<Option<String>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one operation started at `start`.
    pub fn record<T>(&self, start: Instant, result: &DbResult<T>) {
        match result {
            Ok(_) => self.record_success(start.elapsed()),
            Err(e) => self.record_error(start.elapsed(), &e.to_string()),
        }
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.push_latency(elapsed);
    }

    pub fn record_error(&self, elapsed: Duration, message: &str) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.push_latency(elapsed);
        let mut last_error = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last_error = Some(message.to_string());
    }

    /// Record a failure that is not tied to a timed operation (e.g. connect).
    pub fn record_failure(&self, message: &str) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut last_error = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last_error = Some(message.to_string());
    }

    fn push_latency(&self, elapsed: Duration) {
        let mut latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    /// Rolling average latency in milliseconds.
    pub fn average_query_time(&self) -> f64 {
        let latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        }
    }

    pub fn snapshot(&self, pool: PoolStats) -> DatabaseMetrics {
        DatabaseMetrics {
            active_connections: pool.active(),
            total_connections: pool.size,
            query_count: self.query_count.load(Ordering::Relaxed),
            average_query_time: self.average_query_time(),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}
