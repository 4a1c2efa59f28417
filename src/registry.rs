//! In-memory agent table
//!
//! The registry is the authoritative view of which agents exist and whether
//! they are online. Storage is written behind it: every change is persisted
//! asynchronously, and on startup the table is hydrated from storage so
//! liveness tracking survives restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::storage::StorageBackend;
use crate::types::{AgentInfo, AgentStatus, AlertEvent, MetricsEnvelope};

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentInfo>>,
    storage: Arc<dyn StorageBackend>,
    offline_threshold: chrono::Duration,
    persist_errors: AtomicU64,
}

impl AgentRegistry {
    pub fn new(storage: Arc<dyn StorageBackend>, offline_threshold: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            storage,
            offline_threshold: chrono::Duration::from_std(offline_threshold)
                .unwrap_or(chrono::Duration::MAX),
            persist_errors: AtomicU64::new(0),
        }
    }

    /// Load every stored agent into the table.
    ///
    /// Statuses are taken as stored. An agent stored `online` whose
    /// `last_seen` is already stale is picked up by the next liveness sweep.
    #[instrument(skip(self))]
    pub async fn hydrate(&self) -> Result<usize> {
        let stored = self.storage.list_agents(None).await?;
        let count = stored.len();
        let mut agents = self.agents.write();
        for agent in stored {
            agents.insert(agent.id.clone(), agent);
        }
        info!("hydrated registry with {count} agents");
        Ok(count)
    }

    /// Record a report from `envelope` at `now` and return the updated entry.
    ///
    /// The agent is created on first sight. Any previous status, including
    /// `error`, becomes `online`. Persistence runs on a spawned task.
    pub fn touch(self: &Arc<Self>, envelope: &MetricsEnvelope, now: DateTime<Utc>) -> AgentInfo {
        let agent = {
            let mut agents = self.agents.write();
            let agent = agents
                .entry(envelope.agent_id.clone())
                .or_insert_with(|| {
                    debug!(agent_id = %envelope.agent_id, "registering new agent");
                    AgentInfo::new(envelope.agent_id.clone(), envelope.hostname.clone(), now)
                });
            agent.hostname = envelope.hostname.clone();
            if !envelope.version.is_empty() {
                agent.version = envelope.version.clone();
            }
            if envelope.port.is_some() {
                agent.port = envelope.port;
            }
            agent.status = AgentStatus::Online;
            agent.last_seen = agent.last_seen.max(now);
            agent.updated_at = now;
            agent.clone()
        };

        let registry = Arc::clone(self);
        let id = agent.id.clone();
        tokio::spawn(async move {
            // Persist whatever is current when the task runs, so a slow task
            // never overwrites a newer touch with older state.
            let Some(current) = registry.get(&id) else {
                return;
            };
            if let Err(e) = registry.storage.register_or_update_agent(&current).await {
                registry.persist_errors.fetch_add(1, Ordering::Relaxed);
                error!(agent_id = %id, "failed to persist agent: {e}");
            }
        });

        agent
    }

    pub fn get(&self, id: &str) -> Option<AgentInfo> {
        self.agents.read().get(id).cloned()
    }

    /// All agents ordered by hostname, then id
    pub fn list(&self) -> Vec<AgentInfo> {
        let mut agents = self.snapshot_for_persistence();
        agents.sort_by(|a, b| a.hostname.cmp(&b.hostname).then_with(|| a.id.cmp(&b.id)));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    pub fn snapshot_for_persistence(&self) -> Vec<AgentInfo> {
        self.agents.read().values().cloned().collect()
    }

    pub fn remove(&self, id: &str) -> Option<AgentInfo> {
        self.agents.write().remove(id)
    }

    pub fn persist_errors(&self) -> u64 {
        self.persist_errors.load(Ordering::Relaxed)
    }

    /// Mark every online agent silent for longer than the threshold as
    /// offline, persist the change and return one event per transition.
    #[instrument(skip(self))]
    pub async fn check_liveness(&self, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let transitioned: Vec<AgentInfo> = {
            let mut agents = self.agents.write();
            agents
                .values_mut()
                .filter(|a| a.status == AgentStatus::Online && now - a.last_seen > self.offline_threshold)
                .map(|agent| {
                    agent.status = AgentStatus::Offline;
                    agent.updated_at = now;
                    agent.clone()
                })
                .collect()
        };

        let mut events = Vec::with_capacity(transitioned.len());
        for agent in transitioned {
            warn!(
                agent_id = %agent.id,
                hostname = %agent.hostname,
                "agent offline, last seen {}",
                agent.last_seen
            );
            if let Err(e) = self
                .storage
                .update_agent_status(&agent.id, AgentStatus::Offline, now)
                .await
            {
                self.persist_errors.fetch_add(1, Ordering::Relaxed);
                error!(agent_id = %agent.id, "failed to persist offline status: {e}");
            }
            events.push(AlertEvent::AgentOffline { agent });
        }
        events
    }

    /// Write the whole table back to storage
    pub async fn persist_all(&self) -> Result<()> {
        for agent in self.snapshot_for_persistence() {
            self.storage.register_or_update_agent(&agent).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use chrono::Duration as ChronoDuration;

    fn registry() -> (Arc<AgentRegistry>, Arc<MemoryBackend>) {
        let storage = Arc::new(MemoryBackend::new());
        let registry = Arc::new(AgentRegistry::new(storage.clone(), Duration::from_secs(300)));
        (registry, storage)
    }

    #[tokio::test]
    async fn touch_sets_online_and_last_seen() {
        let (registry, _) = registry();
        let now = Utc::now();
        let agent = registry.touch(&MetricsEnvelope::new("A1", "h1", now), now);
        assert_eq!(agent.status, AgentStatus::Online);
        assert!(agent.last_seen >= now);
        assert_eq!(registry.get("A1"), Some(agent));
    }

    #[tokio::test]
    async fn touch_clears_error_status() {
        let (registry, _) = registry();
        let now = Utc::now();
        registry.touch(&MetricsEnvelope::new("A1", "h1", now), now);
        registry.agents.write().get_mut("A1").unwrap().status = AgentStatus::Error;

        let later = now + ChronoDuration::seconds(1);
        let agent = registry.touch(&MetricsEnvelope::new("A1", "h1", later), later);
        assert_eq!(agent.status, AgentStatus::Online);
    }

    #[tokio::test]
    async fn liveness_emits_once_per_transition() {
        let (registry, storage) = registry();
        let t0 = Utc::now();
        registry.touch(&MetricsEnvelope::new("A1", "h1", t0), t0);
        registry.persist_all().await.unwrap();

        let later = t0 + ChronoDuration::seconds(301);
        let events = registry.check_liveness(later).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_id(), "A1");
        assert_eq!(registry.get("A1").unwrap().status, AgentStatus::Offline);
        assert_eq!(storage.get_agent("A1").await.unwrap().status, AgentStatus::Offline);

        assert!(registry.check_liveness(later + ChronoDuration::minutes(1)).await.is_empty());
    }

    #[tokio::test]
    async fn exactly_at_threshold_stays_online() {
        let (registry, _) = registry();
        let t0 = Utc::now();
        registry.touch(&MetricsEnvelope::new("A1", "h1", t0), t0);
        let events = registry.check_liveness(t0 + ChronoDuration::seconds(300)).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn hydrate_keeps_stored_status() {
        let (registry, storage) = registry();
        let mut agent = AgentInfo::new("A1", "h1", Utc::now() - ChronoDuration::hours(1));
        agent.status = AgentStatus::Offline;
        storage.register_or_update_agent(&agent).await.unwrap();

        assert_eq!(registry.hydrate().await.unwrap(), 1);
        assert_eq!(registry.get("A1").unwrap().status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn list_returns_copies_sorted() {
        let (registry, _) = registry();
        let now = Utc::now();
        registry.touch(&MetricsEnvelope::new("b", "zeta", now), now);
        registry.touch(&MetricsEnvelope::new("a", "alpha", now), now);
        let mut list = registry.list();
        assert_eq!(list[0].hostname, "alpha");
        list[0].hostname = "changed".into();
        assert_eq!(registry.get("a").unwrap().hostname, "alpha");
    }
}
