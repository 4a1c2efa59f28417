//! Per-operation query accounting

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Weight of the newest sample in the moving average
const EWMA_ALPHA: f64 = 0.1;

/// Snapshot returned by `StorageBackend::stats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub driver: String,
    pub query_count: u64,
    pub query_errors: u64,
    pub slow_queries: u64,
    /// Exponentially weighted, in milliseconds
    pub avg_query_time_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cached_statements: usize,
}

#[derive(Debug)]
pub struct QueryStats {
    enabled: bool,
    slow_threshold: Duration,
    query_count: AtomicU64,
    query_errors: AtomicU64,
    slow_queries: AtomicU64,
    avg_ms: Mutex<Option<f64>>,
}

impl QueryStats {
    pub fn new(enabled: bool, slow_threshold: Duration) -> Self {
        Self {
            enabled,
            slow_threshold,
            query_count: AtomicU64::new(0),
            query_errors: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            avg_ms: Mutex::new(None),
        }
    }

    /// Run `fut` under `timeout`, recording its outcome as operation `op`
    pub async fn observe<T, F>(&self, op: &'static str, timeout: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(op, format!("query exceeded {timeout:?}"))),
        };
        self.record(op, started.elapsed(), result.is_ok());
        result
    }

    pub fn record(&self, op: &'static str, elapsed: Duration, ok: bool) {
        if !self.enabled {
            return;
        }

        self.query_count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.query_errors.fetch_add(1, Ordering::Relaxed);
        }
        if elapsed > self.slow_threshold {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            warn!(op, elapsed_ms = elapsed.as_millis() as u64, "slow query");
        }

        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut avg = self.avg_ms.lock();
        *avg = Some(match *avg {
            Some(prev) => prev + EWMA_ALPHA * (sample - prev),
            None => sample,
        });
    }

    pub fn snapshot(&self, driver: &str) -> StorageStats {
        StorageStats {
            driver: driver.to_string(),
            query_count: self.query_count.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            avg_query_time_ms: self.avg_ms.lock().unwrap_or(0.0),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn records_errors_and_slow_queries() {
        let stats = QueryStats::new(true, Duration::from_millis(100));
        stats.record("a", Duration::from_millis(10), true);
        stats.record("b", Duration::from_millis(200), false);
        let snap = stats.snapshot("sqlite");
        assert_eq!(snap.query_count, 2);
        assert_eq!(snap.query_errors, 1);
        assert_eq!(snap.slow_queries, 1);
        assert!((snap.avg_query_time_ms - 29.0).abs() < 1.0);
    }

    #[test]
    fn disabled_stats_stay_zero() {
        let stats = QueryStats::new(false, Duration::from_millis(1));
        stats.record("a", Duration::from_secs(1), false);
        assert_eq!(stats.snapshot("memory").query_count, 0);
    }

    #[tokio::test]
    async fn observe_enforces_deadline() {
        let stats = QueryStats::new(true, Duration::from_secs(1));
        let result: Result<()> = stats
            .observe("sleepy", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(stats.snapshot("x").query_errors, 1);
    }
}
