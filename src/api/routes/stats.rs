//! Server statistics endpoint

use axum::{Json, extract::State};
use chrono::Utc;
use serde::Serialize;

use crate::api::state::ApiState;
use crate::ingest::IngestStatsSnapshot;
use crate::notify::NotifyStatsSnapshot;
use crate::storage::StorageStats;
use crate::types::AgentStatus;

#[derive(Debug, Default, Serialize)]
pub struct AgentCounts {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
    pub persist_errors: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_secs: i64,
    pub agents: AgentCounts,
    pub storage: StorageStats,
    pub ingest: IngestStatsSnapshot,
    pub notify: NotifyStatsSnapshot,
}

/// GET /v1/stats
#[utoipa::path(
    get,
    path = "/v1/stats",
    tag = "system",
    responses((status = 200, description = "Storage, ingestion and notification counters"))
)]
pub async fn get_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let mut agents = AgentCounts {
        persist_errors: state.registry.persist_errors(),
        ..Default::default()
    };
    for agent in state.registry.list() {
        agents.total += 1;
        match agent.status {
            AgentStatus::Online => agents.online += 1,
            AgentStatus::Offline => agents.offline += 1,
            AgentStatus::Error => agents.error += 1,
        }
    }

    Json(StatsResponse {
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        agents,
        storage: state.storage.stats(),
        ingest: state.ingest.stats(),
        notify: state.notify.stats(),
    })
}
