//! Helper functions for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use wameter::{
    Result,
    alerts::AlertThresholds,
    config::{NotifyConfig, StorageConfig, WebhookConfig},
    ingest::IngestPipeline,
    notify::{Notifier, NotifyHandle, SinkType},
    registry::AgentRegistry,
    storage::StorageBackend,
    types::{
        AlertEvent, ChangeAction, InterfaceSnapshot, InterfaceStats, InterfaceType, IpChange,
        IpVersion, MetricsEnvelope,
    },
};

pub const OFFLINE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

pub fn create_interface(name: &str, stats: InterfaceStats) -> InterfaceSnapshot {
    InterfaceSnapshot {
        name: name.to_string(),
        kind: InterfaceType::Ethernet,
        mac: "00:11:22:33:44:55".to_string(),
        mtu: 1500,
        status: "up".to_string(),
        ipv4: vec!["10.0.0.5".to_string()],
        ipv6: Vec::new(),
        stats: Some(stats),
    }
}

pub fn create_envelope(agent_id: &str, at: DateTime<Utc>) -> MetricsEnvelope {
    let mut envelope = MetricsEnvelope::new(agent_id, "h1", at);
    envelope.version = "1.2.0".to_string();
    envelope
}

/// Envelope carrying a single `eth0` interface with the given counters
pub fn create_envelope_with_eth0(agent_id: &str, at: DateTime<Utc>, stats: InterfaceStats) -> MetricsEnvelope {
    let mut envelope = create_envelope(agent_id, at);
    envelope
        .payload
        .interfaces
        .insert("eth0".to_string(), create_interface("eth0", stats));
    envelope
}

pub fn create_ip_change(agent_id: &str, at: DateTime<Utc>) -> IpChange {
    IpChange {
        agent_id: agent_id.to_string(),
        interface_name: "eth0".to_string(),
        version: IpVersion::Ipv4,
        is_external: false,
        old_addrs: vec!["10.0.0.5".to_string()],
        new_addrs: vec!["10.0.0.6".to_string()],
        action: ChangeAction::Update,
        reason: "dhcp renew".to_string(),
        timestamp: at,
        created_at: None,
    }
}

pub fn create_sqlite_config(dir: &Path) -> StorageConfig {
    StorageConfig {
        dsn: dir.join("wameter.db").to_string_lossy().to_string(),
        batch_pause: Duration::from_millis(1),
        ..Default::default()
    }
}

pub fn create_webhook_config(url: &str, secret: Option<&str>) -> WebhookConfig {
    WebhookConfig {
        enabled: true,
        url: url.to_string(),
        secret: secret.map(String::from),
        headers: BTreeMap::new(),
        common_data: Default::default(),
        timeout: Duration::from_secs(2),
        max_retries: Some(3),
    }
}

/// Notification settings with millisecond backoff
pub fn create_notify_config() -> NotifyConfig {
    NotifyConfig {
        enabled: true,
        retry_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn create_pipeline(storage: Arc<dyn StorageBackend>, notify: NotifyHandle) -> (Arc<IngestPipeline>, Arc<AgentRegistry>) {
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&storage), OFFLINE_THRESHOLD));
    let pipeline = IngestPipeline::new(storage, Arc::clone(&registry), notify, AlertThresholds::default());
    (Arc::new(pipeline), registry)
}

/// Sink that records every event it is asked to deliver
pub struct RecordingSink {
    kind: SinkType,
    pub events: Mutex<Vec<AlertEvent>>,
}

impl RecordingSink {
    pub fn new(kind: SinkType) -> Arc<Self> {
        Arc::new(Self {
            kind,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event_type()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingSink {
    fn sink_type(&self) -> SinkType {
        self.kind
    }

    async fn send(&self, event: &AlertEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
