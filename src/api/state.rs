//! API shared state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::api::middleware::auth::Authenticator;
use crate::health::HealthChecker;
use crate::ingest::IngestPipeline;
use crate::notify::NotifyHandle;
use crate::registry::AgentRegistry;
use crate::storage::StorageBackend;

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Durable rows: metrics, IP changes, agent mirror
    pub storage: Arc<dyn StorageBackend>,

    /// Authoritative in-memory agent table
    pub registry: Arc<AgentRegistry>,

    /// Request path for inbound reports
    pub ingest: Arc<IngestPipeline>,

    /// Producer side of the notification queue, read for counters only
    pub notify: NotifyHandle,

    pub health: HealthChecker,

    pub auth: Arc<Authenticator>,

    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        ingest: Arc<IngestPipeline>,
        notify: NotifyHandle,
        health: HealthChecker,
        auth: Authenticator,
    ) -> Self {
        Self {
            storage,
            registry: Arc::clone(ingest.registry()),
            ingest,
            notify,
            health,
            auth: Arc::new(auth),
            started_at: Utc::now(),
        }
    }
}
