//! HealthActor - Periodic self check
//!
//! Runs the same checks as `/v1/health` on a timer and logs when the overall
//! state flips, so outages show up in the logs even when nobody polls.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::health::{HealthChecker, HealthReport};

#[derive(Clone)]
pub struct HealthActor {
    checker: HealthChecker,
    interval: Duration,
}

impl HealthActor {
    pub fn new(checker: HealthChecker, interval: Duration) -> Self {
        Self { checker, interval }
    }

    fn log_report(report: &HealthReport, previous: Option<bool>) {
        match (previous, report.healthy) {
            (Some(true) | None, false) => {
                for component in report.unhealthy_components() {
                    warn!(
                        component = %component.name,
                        status = ?component.status,
                        "health check failing: {}",
                        component.message.as_deref().unwrap_or("no detail")
                    );
                }
            }
            (Some(false), true) => info!("all components healthy again"),
            _ => debug!(healthy = report.healthy, "health check"),
        }
    }

    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        debug!(interval = ?self.interval, "starting health actor");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.checker.check().await;
                    Self::log_report(&report, previous);
                    previous = Some(report.healthy);
                }
            }
        }
        debug!("health actor stopped");
    }
}
