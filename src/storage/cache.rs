//! Prepared statement cache
//!
//! Statements are keyed by a stable name (e.g. `"agents.upsert"`) and hold
//! the dialect-specific SQL text built once by the query builder. Executing a
//! cached statement marks it persistent, so the driver keeps the prepared
//! handle alive on every pooled connection; uncached statements are prepared
//! and finalized per call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug)]
pub struct StatementCache {
    enabled: bool,
    statements: DashMap<&'static str, Arc<str>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatementCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            statements: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fetch the SQL for `key`, building it on first use.
    ///
    /// With the cache disabled the builder runs every time and nothing is
    /// retained.
    pub fn get_or_prepare(&self, key: &'static str, build: impl FnOnce() -> String) -> Arc<str> {
        if !self.enabled {
            return Arc::from(build());
        }

        if let Some(sql) = self.statements.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(sql.value());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let sql = self
            .statements
            .entry(key)
            .or_insert_with(|| Arc::from(build()));
        Arc::clone(sql.value())
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Remove every cached statement, returning how many were held
    pub fn drain(&self) -> usize {
        let count = self.statements.len();
        self.statements.clear();
        debug!(count, "statement cache drained");
        count
    }
}
