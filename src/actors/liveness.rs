//! LivenessActor - Marks silent agents offline
//!
//! Every `check_interval` the registry is swept; each online agent whose
//! last report is older than the offline threshold flips to `offline` and
//! one `AgentOffline` event is queued for notification.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::notify::NotifyHandle;
use crate::registry::AgentRegistry;

#[derive(Clone)]
pub struct LivenessActor {
    registry: Arc<AgentRegistry>,
    notify: NotifyHandle,
    check_interval: Duration,
}

impl LivenessActor {
    pub fn new(registry: Arc<AgentRegistry>, notify: NotifyHandle, check_interval: Duration) -> Self {
        Self {
            registry,
            notify,
            check_interval,
        }
    }

    /// One sweep; returns the number of agents that went offline
    pub async fn sweep(&self) -> usize {
        let events = self.registry.check_liveness(Utc::now()).await;
        let count = events.len();
        for event in events {
            if !self.notify.enqueue(event) && self.notify.is_enabled() {
                warn!("offline notification dropped");
            }
        }
        count
    }

    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        debug!(interval = ?self.check_interval, "starting liveness actor");
        let mut ticker = time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let offline = self.sweep().await;
                    if offline > 0 {
                        info!("{offline} agents went offline");
                    }
                }
            }
        }
        debug!("liveness actor stopped");
    }
}
