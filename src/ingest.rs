//! Report ingestion
//!
//! The request path validates a report, persists the envelope plus its
//! IP-change rows in one write and then touches the registry; errors there go
//! back to the caller.
//! Rate derivation and alert evaluation run afterwards on a tracked
//! background task whose failures are only logged and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, instrument, warn};

use crate::alerts::{AlertThresholds, evaluate};
use crate::error::{Error, Result};
use crate::notify::NotifyHandle;
use crate::registry::AgentRegistry;
use crate::storage::StorageBackend;
use crate::types::{AgentInfo, InterfaceStats, MetricsEnvelope, SCHEMA_VERSION};

const OP: &str = "ingest.validate";

#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    ip_changes: AtomicU64,
    alerts_emitted: AtomicU64,
    alerts_dropped: AtomicU64,
    background_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub ip_changes: u64,
    pub alerts_emitted: u64,
    pub alerts_dropped: u64,
    pub background_failures: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            ip_changes: self.ip_changes.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            alerts_dropped: self.alerts_dropped.load(Ordering::Relaxed),
            background_failures: self.background_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub index: usize,
    pub agent_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub accepted: usize,
    pub rejected: usize,
    pub items: Vec<BatchItem>,
}

pub struct IngestPipeline {
    storage: Arc<dyn StorageBackend>,
    registry: Arc<AgentRegistry>,
    notify: NotifyHandle,
    thresholds: AlertThresholds,
    max_future_skew: Option<chrono::Duration>,
    stats: Arc<IngestStats>,
    tasks: TaskTracker,
}

impl IngestPipeline {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        registry: Arc<AgentRegistry>,
        notify: NotifyHandle,
        thresholds: AlertThresholds,
    ) -> Self {
        Self {
            storage,
            registry,
            notify,
            thresholds,
            max_future_skew: None,
            stats: Arc::new(IngestStats::default()),
            tasks: TaskTracker::new(),
        }
    }

    /// Reject reports stamped further than `skew` into the future
    pub fn with_max_future_skew(mut self, skew: Option<Duration>) -> Self {
        self.max_future_skew = skew.and_then(|s| chrono::Duration::from_std(s).ok());
        self
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Wait until every background task started so far has finished
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Check the structural rules a report must satisfy.
    ///
    /// `reported_at` is the server's receive time: whatever the agent sent is
    /// replaced with `now`. IP-change agent ids are filled from the envelope.
    pub fn validate(&self, envelope: &mut MetricsEnvelope, now: DateTime<Utc>) -> Result<()> {
        envelope.reported_at = now;
        if envelope.agent_id.trim().is_empty() {
            return Err(Error::invalid_input(OP, "agent_id is required"));
        }
        if envelope.hostname.trim().is_empty() {
            return Err(Error::invalid_input(OP, "hostname is required"));
        }
        if envelope.collected_at > envelope.reported_at {
            return Err(Error::invalid_input(OP, "collected_at is later than the time of receipt"));
        }
        let version = envelope.payload.schema_version;
        if version == 0 || version > SCHEMA_VERSION {
            return Err(Error::invalid_input(
                OP,
                format!("unsupported schema_version {version}"),
            ));
        }
        if let Some(skew) = self.max_future_skew {
            if envelope.timestamp - now > skew {
                return Err(Error::invalid_input(OP, "timestamp is too far in the future"));
            }
        }

        for change in &mut envelope.payload.ip_changes {
            if change.agent_id.is_empty() {
                change.agent_id = envelope.agent_id.clone();
            } else if change.agent_id != envelope.agent_id {
                return Err(Error::invalid_input(OP, "ip change belongs to another agent"));
            }
            change.validate()?;
        }
        Ok(())
    }

    pub async fn ingest(&self, envelope: MetricsEnvelope) -> Result<AgentInfo> {
        self.ingest_at(envelope, Utc::now()).await
    }

    /// Accept one report received at `now`
    #[instrument(skip_all, fields(agent_id = %envelope.agent_id))]
    pub async fn ingest_at(&self, mut envelope: MetricsEnvelope, now: DateTime<Utc>) -> Result<AgentInfo> {
        if let Err(e) = self.validate(&mut envelope, now) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        self.storage.save_reports(std::slice::from_ref(&envelope)).await?;
        let agent = self.registry.touch(&envelope, now);
        self.stats
            .ip_changes
            .fetch_add(envelope.payload.ip_changes.len() as u64, Ordering::Relaxed);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        self.spawn_processing(vec![(envelope, agent.clone())]);
        Ok(agent)
    }

    pub async fn ingest_batch(&self, envelopes: Vec<MetricsEnvelope>) -> Result<BatchResult> {
        self.ingest_batch_at(envelopes, Utc::now()).await
    }

    /// Validate every report, persist the valid ones with their IP changes in
    /// one transaction and report per-item status. Invalid items never reach
    /// storage, and a storage failure leaves the registry untouched.
    #[instrument(skip_all, fields(count = envelopes.len()))]
    pub async fn ingest_batch_at(&self, envelopes: Vec<MetricsEnvelope>, now: DateTime<Utc>) -> Result<BatchResult> {
        let mut result = BatchResult::default();
        let mut valid = Vec::with_capacity(envelopes.len());

        for (index, mut envelope) in envelopes.into_iter().enumerate() {
            match self.validate(&mut envelope, now) {
                Ok(()) => {
                    result.items.push(BatchItem {
                        index,
                        agent_id: envelope.agent_id.clone(),
                        status: ItemStatus::Accepted,
                        error: None,
                    });
                    valid.push(envelope);
                }
                Err(e) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    result.items.push(BatchItem {
                        index,
                        agent_id: envelope.agent_id.clone(),
                        status: ItemStatus::Rejected,
                        error: Some(e.message().to_string()),
                    });
                }
            }
        }
        result.rejected = result.items.len() - valid.len();
        if valid.is_empty() {
            return Ok(result);
        }

        self.storage.save_reports(&valid).await?;
        let agents: Vec<AgentInfo> = valid.iter().map(|e| self.registry.touch(e, now)).collect();
        let changes: usize = valid.iter().map(|e| e.payload.ip_changes.len()).sum();
        self.stats.ip_changes.fetch_add(changes as u64, Ordering::Relaxed);

        result.accepted = valid.len();
        self.stats.accepted.fetch_add(valid.len() as u64, Ordering::Relaxed);
        self.spawn_processing(valid.into_iter().zip(agents).collect());
        Ok(result)
    }

    fn spawn_processing(&self, work: Vec<(MetricsEnvelope, AgentInfo)>) {
        let storage = Arc::clone(&self.storage);
        let notify = self.notify.clone();
        let thresholds = self.thresholds.clone();
        let stats = Arc::clone(&self.stats);

        self.tasks.spawn(async move {
            for (mut envelope, agent) in work {
                match storage.get_previous_metrics(&envelope.agent_id, envelope.collected_at).await {
                    Ok(Some(previous)) => derive_rates(&mut envelope, &previous),
                    Ok(None) => debug!(agent_id = %envelope.agent_id, "no prior report, rates left at zero"),
                    Err(e) => {
                        stats.background_failures.fetch_add(1, Ordering::Relaxed);
                        error!(agent_id = %envelope.agent_id, "failed to load prior report: {e}");
                    }
                }

                for event in evaluate(&envelope, &agent, &thresholds) {
                    if notify.enqueue(event) {
                        stats.alerts_emitted.fetch_add(1, Ordering::Relaxed);
                    } else if notify.is_enabled() {
                        stats.alerts_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(agent_id = %envelope.agent_id, "alert dropped");
                    }
                }
            }
        });
    }
}

fn rate(new: u64, old: u64, secs: f64) -> f64 {
    if new <= old {
        return 0.0;
    }
    (new - old) as f64 / secs
}

/// Fill the derived per-second rates of `current` from `previous`.
///
/// Interfaces missing from either report, or an interval that is not
/// positive, leave the rates at zero. A counter that did not grow yields 0.
pub fn derive_rates(current: &mut MetricsEnvelope, previous: &MetricsEnvelope) {
    let elapsed = current.collected_at - previous.collected_at;
    let secs = elapsed.num_milliseconds() as f64 / 1000.0;
    if secs <= 0.0 {
        return;
    }

    for (name, snapshot) in current.payload.interfaces.iter_mut() {
        let Some(stats) = snapshot.stats.as_mut() else {
            continue;
        };
        let Some(prior) = previous
            .payload
            .interfaces
            .get(name)
            .and_then(|s| s.stats.as_ref())
        else {
            continue;
        };
        apply_rates(stats, prior, secs);
    }
}

fn apply_rates(stats: &mut InterfaceStats, prior: &InterfaceStats, secs: f64) {
    stats.rx_bytes_rate = rate(stats.rx_bytes, prior.rx_bytes, secs);
    stats.tx_bytes_rate = rate(stats.tx_bytes, prior.tx_bytes, secs);
    stats.rx_packets_rate = rate(stats.rx_packets, prior.rx_packets, secs);
    stats.tx_packets_rate = rate(stats.tx_packets, prior.tx_packets, secs);
}
