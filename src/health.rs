//! Component health checks behind `/v1/health`
//!
//! Storage is critical: a failed ping makes the report unhealthy. Sinks are
//! not; an unreachable sink marks its component `degraded` so a chat outage
//! never takes the server out of a load balancer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::registry::AgentRegistry;
use crate::storage::StorageBackend;

pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn unhealthy_components(&self) -> impl Iterator<Item = &ComponentHealth> {
        self.components
            .iter()
            .filter(|c| c.status != ComponentStatus::Healthy)
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    storage: Arc<dyn StorageBackend>,
    registry: Arc<AgentRegistry>,
    sinks: Vec<Arc<dyn Notifier>>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(storage: Arc<dyn StorageBackend>, registry: Arc<AgentRegistry>, sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            storage,
            registry,
            sinks,
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[instrument(skip(self))]
    pub async fn check(&self) -> HealthReport {
        let storage = probe("storage", self.timeout, ComponentStatus::Unhealthy, self.storage.ping());
        let sinks = join_all(self.sinks.iter().map(|sink| {
            probe(
                format!("sink:{}", sink.sink_type()),
                self.timeout,
                ComponentStatus::Degraded,
                sink.health(),
            )
        }));
        let (storage, sinks) = futures::join!(storage, sinks);

        let mut components = Vec::with_capacity(sinks.len() + 2);
        components.push(storage);
        components.push(ComponentHealth {
            name: "registry".into(),
            status: ComponentStatus::Healthy,
            message: Some(format!("{} agents tracked", self.registry.len())),
            latency_ms: 0,
        });
        components.extend(sinks);

        let healthy = components
            .iter()
            .all(|c| c.status != ComponentStatus::Unhealthy);
        debug!(healthy, "health check complete");
        HealthReport {
            healthy,
            components,
            checked_at: Utc::now(),
        }
    }
}

async fn probe(
    name: impl Into<String>,
    timeout: Duration,
    on_failure: ComponentStatus,
    check: impl Future<Output = Result<()>>,
) -> ComponentHealth {
    let name = name.into();
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, check).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout("health.check", format!("{name} did not answer in time"))),
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(()) => ComponentHealth {
            name,
            status: ComponentStatus::Healthy,
            message: None,
            latency_ms,
        },
        Err(e) => ComponentHealth {
            name,
            status: on_failure,
            // Kind only: causes may carry DSNs or endpoints.
            message: Some(format!("{} failed ({})", e.op(), e.kind())),
            latency_ms,
        },
    }
}
