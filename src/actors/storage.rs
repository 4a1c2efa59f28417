//! StorageActor - Retention pruning and connection pings
//!
//! ## Schedule
//!
//! - **Prune**: every `prune_interval` (first run at startup), delete metrics
//!   older than `now - metrics_retention` through the driver's batched
//!   `cleanup`.
//! - **Ping**: every `ping_interval`, check the database answers. Failures
//!   are logged and retried on the next tick.
//!
//! The actor shares the lifecycle's cancellation root and is awaited before
//! the storage driver is closed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use crate::config::StorageConfig;
use crate::error::Result;
use crate::storage::{CleanupSummary, StorageBackend};

#[derive(Clone)]
pub struct StorageActor {
    storage: Arc<dyn StorageBackend>,
    pruning: bool,
    prune_interval: Duration,
    retention: Duration,
    ping_interval: Duration,
}

impl StorageActor {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &StorageConfig) -> Self {
        Self {
            storage,
            pruning: config.enable_pruning,
            prune_interval: config.prune_interval,
            retention: config.metrics_retention,
            ping_interval: config.ping_interval,
        }
    }

    /// Delete everything older than the retention period, stopping between
    /// batches once `cancel` fires
    pub async fn prune(&self, cancel: &CancellationToken) -> Result<CleanupSummary> {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        debug!("running retention cleanup (deleting data before {cutoff})");
        self.storage.cleanup(cutoff, cancel).await
    }

    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        debug!(
            "starting storage actor (pruning: {}, driver: {})",
            self.pruning,
            self.storage.driver()
        );

        let mut prune_ticker = time::interval(self.prune_interval);
        prune_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_ticker = time::interval(self.ping_interval);
        ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_failures = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = prune_ticker.tick(), if self.pruning => {
                    match self.prune(&cancel).await {
                        Ok(summary) if summary.cancelled => info!(
                            "retention cleanup interrupted by shutdown after {} metrics",
                            summary.deleted
                        ),
                        Ok(summary) if summary.deleted > 0 => info!(
                            "retention cleanup complete: deleted {} old metrics in {} batches",
                            summary.deleted, summary.batches
                        ),
                        Ok(_) => trace!("retention cleanup: no old metrics to delete"),
                        // Retried on the next interval.
                        Err(e) => error!("retention cleanup failed: {e}"),
                    }
                }

                _ = ping_ticker.tick() => {
                    match self.storage.ping().await {
                        Ok(()) => {
                            if ping_failures > 0 {
                                info!("database reachable again after {ping_failures} failed pings");
                            }
                            ping_failures = 0;
                        }
                        Err(e) => {
                            ping_failures += 1;
                            error!(ping_failures, "database ping failed: {e}");
                        }
                    }
                }
            }
        }
        debug!("storage actor stopped");
    }
}
