//! In-memory storage backend (no persistence)
//!
//! Useful for:
//! - Testing without database files
//! - Short-lived deployments where history does not matter
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Linear scans**: Queries walk every stored envelope

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backend::{
    CONSTRAINED_CLEANUP_BATCH, CleanupSummary, IpChangeSummary, OrderBy, Page, QueryParams,
    SortOrder, StorageBackend,
};
use super::schema::summarize_changes;
use super::stats::{QueryStats, StorageStats};
use crate::error::{Error, Result};
use crate::types::{AgentInfo, AgentStatus, IpChange, MetricsEnvelope};

#[derive(Debug, Clone)]
struct StoredMetric {
    id: u64,
    envelope: MetricsEnvelope,
}

#[derive(Debug, Clone)]
struct StoredChange {
    id: u64,
    change: IpChange,
}

#[derive(Debug, Default)]
struct Tables {
    agents: HashMap<String, AgentInfo>,
    metrics: Vec<StoredMetric>,
    ip_changes: Vec<StoredChange>,
    next_id: u64,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory storage backend
///
/// Rows live in plain vectors behind one lock; ids are assigned in insert
/// order so ties on timestamps break the same way the SQL drivers break them.
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    stats: QueryStats,
    batch_size: usize,
    closed: RwLock<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_batch_size(CONSTRAINED_CLEANUP_BATCH)
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            stats: QueryStats::new(true, Duration::from_secs(1)),
            batch_size: batch_size.max(1),
            closed: RwLock::new(false),
        }
    }

    /// Number of stored envelopes across all agents
    pub fn metrics_len(&self) -> usize {
        self.tables.read().metrics.len()
    }

    fn track<T>(&self, op: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if *self.closed.read() {
            return Err(Error::unavailable(op, "storage is closed"));
        }
        let started = Instant::now();
        let result = f();
        self.stats.record(op, started.elapsed(), result.is_ok());
        result
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn compare(a: &StoredMetric, b: &StoredMetric, order_by: OrderBy) -> Ordering {
    let (x, y) = (&a.envelope, &b.envelope);
    let primary = match order_by {
        OrderBy::Timestamp => x.timestamp.cmp(&y.timestamp),
        OrderBy::CollectedAt => x.collected_at.cmp(&y.collected_at),
        OrderBy::ReportedAt => x.reported_at.cmp(&y.reported_at),
        OrderBy::AgentId => x.agent_id.cmp(&y.agent_id),
    };
    primary.then(a.id.cmp(&b.id))
}

fn newest_first(changes: &mut [StoredChange]) {
    changes.sort_by(|a, b| {
        b.change
            .timestamp
            .cmp(&a.change.timestamp)
            .then(b.id.cmp(&a.id))
    });
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn driver(&self) -> &'static str {
        "memory"
    }

    async fn register_or_update_agent(&self, agent: &AgentInfo) -> Result<()> {
        self.track("agents.upsert", || {
            let mut tables = self.tables.write();
            match tables.agents.get_mut(&agent.id) {
                Some(existing) => {
                    let registered_at = existing.registered_at;
                    *existing = agent.clone();
                    existing.registered_at = registered_at;
                }
                None => {
                    tables.agents.insert(agent.id.clone(), agent.clone());
                }
            }
            Ok(())
        })
    }

    async fn update_agent_status(&self, id: &str, status: AgentStatus, now: DateTime<Utc>) -> Result<()> {
        const OP: &str = "agents.update_status";
        self.track(OP, || {
            let mut tables = self.tables.write();
            let agent = tables
                .agents
                .get_mut(id)
                .ok_or_else(|| Error::not_found(OP, format!("agent '{id}' not found")))?;
            agent.status = status;
            agent.updated_at = now;
            if status == AgentStatus::Online {
                agent.last_seen = now;
            }
            Ok(())
        })
    }

    async fn get_agent(&self, id: &str) -> Result<AgentInfo> {
        const OP: &str = "agents.get";
        self.track(OP, || {
            self.tables
                .read()
                .agents
                .get(id)
                .cloned()
                .ok_or_else(|| Error::not_found(OP, format!("agent '{id}' not found")))
        })
    }

    async fn list_agents(&self, page: Option<Page>) -> Result<Vec<AgentInfo>> {
        self.track("agents.list", || {
            let mut agents: Vec<AgentInfo> = self.tables.read().agents.values().cloned().collect();
            agents.sort_by(|a, b| a.hostname.cmp(&b.hostname).then_with(|| a.id.cmp(&b.id)));
            Ok(match page {
                Some(page) => agents.into_iter().skip(page.offset).take(page.limit).collect(),
                None => agents,
            })
        })
    }

    async fn delete_agent(&self, id: &str) -> Result<()> {
        const OP: &str = "agents.delete";
        self.track(OP, || {
            let mut tables = self.tables.write();
            if tables.agents.remove(id).is_none() {
                return Err(Error::not_found(OP, format!("agent '{id}' not found")));
            }
            tables.metrics.retain(|m| m.envelope.agent_id != id);
            tables.ip_changes.retain(|c| c.change.agent_id != id);
            Ok(())
        })
    }

    async fn save_metrics(&self, envelope: &MetricsEnvelope) -> Result<()> {
        self.save_metrics_batch(std::slice::from_ref(envelope)).await
    }

    async fn save_metrics_batch(&self, envelopes: &[MetricsEnvelope]) -> Result<()> {
        self.track("metrics.save_batch", || {
            let now = Utc::now();
            let mut tables = self.tables.write();
            for envelope in envelopes {
                let id = tables.next_id();
                let mut envelope = envelope.clone();
                envelope.created_at = Some(now);
                tables.metrics.push(StoredMetric { id, envelope });
            }
            Ok(())
        })
    }

    async fn save_reports(&self, envelopes: &[MetricsEnvelope]) -> Result<()> {
        for change in envelopes.iter().flat_map(|e| &e.payload.ip_changes) {
            change.validate()?;
        }
        self.track("reports.save", || {
            let now = Utc::now();
            let mut tables = self.tables.write();
            for envelope in envelopes {
                for change in &envelope.payload.ip_changes {
                    let id = tables.next_id();
                    let mut change = change.clone();
                    change.agent_id = envelope.agent_id.clone();
                    change.created_at = Some(now);
                    tables.ip_changes.push(StoredChange { id, change });
                }
                let id = tables.next_id();
                let mut envelope = envelope.clone();
                envelope.created_at = Some(now);
                tables.metrics.push(StoredMetric { id, envelope });
            }
            Ok(())
        })
    }

    async fn query_metrics(&self, params: &QueryParams) -> Result<Vec<MetricsEnvelope>> {
        self.track("metrics.query", || {
            let tables = self.tables.read();
            let mut rows: Vec<&StoredMetric> = tables
                .metrics
                .iter()
                .filter(|m| {
                    let e = &m.envelope;
                    (params.agent_ids.is_empty() || params.agent_ids.contains(&e.agent_id))
                        && params.start.is_none_or(|start| e.timestamp >= start)
                        && params.end.is_none_or(|end| e.timestamp <= end)
                })
                .collect();

            rows.sort_by(|a, b| compare(a, b, params.order_by));
            if params.order == SortOrder::Desc {
                rows.reverse();
            }

            Ok(rows
                .into_iter()
                .skip(params.offset)
                .take(params.effective_limit())
                .map(|m| m.envelope.clone())
                .collect())
        })
    }

    async fn get_latest_metrics(&self, agent_id: &str) -> Result<MetricsEnvelope> {
        const OP: &str = "metrics.latest";
        self.track(OP, || {
            self.tables
                .read()
                .metrics
                .iter()
                .filter(|m| m.envelope.agent_id == agent_id)
                .max_by(|a, b| compare(a, b, OrderBy::Timestamp))
                .map(|m| m.envelope.clone())
                .ok_or_else(|| Error::not_found(OP, format!("no metrics for agent '{agent_id}'")))
        })
    }

    async fn get_previous_metrics(
        &self,
        agent_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<MetricsEnvelope>> {
        self.track("metrics.previous", || {
            Ok(self
                .tables
                .read()
                .metrics
                .iter()
                .filter(|m| m.envelope.agent_id == agent_id && m.envelope.collected_at < before)
                .max_by(|a, b| compare(a, b, OrderBy::CollectedAt))
                .map(|m| m.envelope.clone()))
        })
    }

    async fn save_ip_change(&self, agent_id: &str, change: &IpChange) -> Result<()> {
        change.validate()?;
        self.track("ip_changes.save", || {
            let mut tables = self.tables.write();
            let id = tables.next_id();
            let mut change = change.clone();
            change.agent_id = agent_id.to_string();
            change.created_at = Some(Utc::now());
            tables.ip_changes.push(StoredChange { id, change });
            Ok(())
        })
    }

    async fn get_recent_ip_changes(&self, agent_id: &str, since: DateTime<Utc>) -> Result<Vec<IpChange>> {
        self.track("ip_changes.recent", || {
            let mut changes: Vec<StoredChange> = self
                .tables
                .read()
                .ip_changes
                .iter()
                .filter(|c| c.change.agent_id == agent_id && c.change.timestamp >= since)
                .cloned()
                .collect();
            newest_first(&mut changes);
            Ok(changes.into_iter().map(|c| c.change).collect())
        })
    }

    async fn get_interface_changes(
        &self,
        agent_id: &str,
        interface: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IpChange>> {
        let changes = self.get_recent_ip_changes(agent_id, since).await?;
        Ok(changes
            .into_iter()
            .filter(|c| c.interface_name == interface)
            .collect())
    }

    async fn get_ip_change_summary(&self, agent_id: &str) -> Result<IpChangeSummary> {
        let changes = self
            .get_recent_ip_changes(agent_id, DateTime::<Utc>::MIN_UTC)
            .await?;
        Ok(summarize_changes(agent_id, &changes))
    }

    async fn cleanup(&self, before: DateTime<Utc>, cancel: &CancellationToken) -> Result<CleanupSummary> {
        let mut summary = CleanupSummary::default();
        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let deleted = self.track("metrics.cleanup", || {
                let mut tables = self.tables.write();
                let mut doomed: Vec<(DateTime<Utc>, u64)> = tables
                    .metrics
                    .iter()
                    .filter(|m| m.envelope.timestamp < before)
                    .map(|m| (m.envelope.timestamp, m.id))
                    .collect();
                doomed.sort();
                doomed.truncate(self.batch_size);
                let ids: HashSet<u64> = doomed.into_iter().map(|(_, id)| id).collect();
                tables.metrics.retain(|m| !ids.contains(&m.id));
                Ok(ids.len())
            })?;

            if deleted == 0 {
                break;
            }
            summary.deleted += deleted as u64;
            summary.batches += 1;
            summary.largest_batch = summary.largest_batch.max(deleted);
            if deleted < self.batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }
        debug!(deleted = summary.deleted, batches = summary.batches, "memory cleanup complete");
        Ok(summary)
    }

    async fn ping(&self) -> Result<()> {
        self.track("ping", || Ok(()))
    }

    async fn close(&self) -> Result<()> {
        *self.closed.write() = true;
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        self.stats.snapshot(self.driver())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn upsert_keeps_registration_time() {
        let backend = MemoryBackend::new();
        let first = Utc::now() - ChronoDuration::hours(1);
        backend
            .register_or_update_agent(&AgentInfo::new("A1", "h1", first))
            .await
            .unwrap();
        let mut later = AgentInfo::new("A1", "h1-renamed", Utc::now());
        later.version = "2.0".into();
        backend.register_or_update_agent(&later).await.unwrap();

        let agent = backend.get_agent("A1").await.unwrap();
        assert_eq!(agent.hostname, "h1-renamed");
        assert_eq!(agent.registered_at, first);
    }

    #[tokio::test]
    async fn query_filters_and_orders() {
        let backend = MemoryBackend::new();
        let base = Utc::now() - ChronoDuration::hours(1);
        for i in 0..5 {
            let agent = if i % 2 == 0 { "A1" } else { "A2" };
            backend
                .save_metrics(&MetricsEnvelope::new(agent, "h", base + ChronoDuration::minutes(i)))
                .await
                .unwrap();
        }

        let params = QueryParams {
            agent_ids: vec!["A1".into()],
            order: SortOrder::Asc,
            ..Default::default()
        };
        let rows = backend.query_metrics(&params).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(rows.iter().all(|r| r.created_at.is_some()));
    }

    #[tokio::test]
    async fn cleanup_respects_batch_size() {
        let backend = MemoryBackend::with_batch_size(3);
        let now = Utc::now();
        for i in 0..10 {
            backend
                .save_metrics(&MetricsEnvelope::new("A1", "h", now - ChronoDuration::days(i)))
                .await
                .unwrap();
        }
        let summary = backend
            .cleanup(now - ChronoDuration::hours(36), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.deleted, 8);
        assert!(summary.largest_batch <= 3);
        assert!(!summary.cancelled);
        assert_eq!(backend.metrics_len(), 2);
    }

    #[tokio::test]
    async fn cancelled_cleanup_stops_between_batches() {
        let backend = MemoryBackend::with_batch_size(2);
        let now = Utc::now();
        for i in 1..=6 {
            backend
                .save_metrics(&MetricsEnvelope::new("A1", "h", now - ChronoDuration::days(i)))
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = backend.cleanup(now, &cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.deleted, 0);
        assert_eq!(backend.metrics_len(), 6);
    }

    #[tokio::test]
    async fn reports_store_their_ip_changes() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let mut envelope = MetricsEnvelope::new("A1", "h", now);
        envelope.payload.ip_changes.push(IpChange {
            agent_id: String::new(),
            interface_name: "eth0".into(),
            version: crate::types::IpVersion::Ipv4,
            is_external: false,
            old_addrs: vec![],
            new_addrs: vec!["10.0.0.1".into()],
            action: crate::types::ChangeAction::Add,
            reason: String::new(),
            timestamp: now,
            created_at: None,
        });
        let mut broken = envelope.clone();
        broken.payload.ip_changes[0].new_addrs.clear();

        assert!(backend.save_reports(&[envelope.clone(), broken]).await.is_err());
        assert_eq!(backend.metrics_len(), 0);

        backend.save_reports(&[envelope]).await.unwrap();
        assert_eq!(backend.metrics_len(), 1);
        let changes = backend
            .get_recent_ip_changes("A1", now - ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].agent_id, "A1");
    }

    #[tokio::test]
    async fn closed_backend_is_unavailable() {
        let backend = MemoryBackend::new();
        backend.close().await.unwrap();
        assert_eq!(backend.ping().await.unwrap_err().kind(), ErrorKind::Unavailable);
    }
}
