//! Agent endpoints

use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::StatusCode,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::info;

use crate::api::{error::ApiResult, state::ApiState};
use crate::storage::IpChangeSummary;
use crate::types::{AgentInfo, IpChange, MetricsEnvelope};

/// Window used by the IP-change listing when `since` is omitted
const DEFAULT_CHANGE_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

/// GET /v1/agents
#[utoipa::path(
    get,
    path = "/v1/agents",
    tag = "agents",
    params(
        ("limit" = Option<usize>, Query, description = "Page size"),
        ("offset" = Option<usize>, Query, description = "Agents to skip"),
    ),
    responses((status = 200, description = "Agents ordered by hostname"))
)]
pub async fn list_agents(
    State(state): State<ApiState>,
    page: Result<Query<Pagination>, QueryRejection>,
) -> ApiResult<Json<Vec<AgentInfo>>> {
    let Query(page) = page?;
    let agents = state
        .registry
        .list()
        .into_iter()
        .skip(page.offset)
        .take(page.limit.unwrap_or(usize::MAX))
        .collect();
    Ok(Json(agents))
}

/// Registry first, then the durable mirror (agents not seen since restart
/// are still in storage).
async fn find_agent(state: &ApiState, id: &str) -> crate::Result<AgentInfo> {
    match state.registry.get(id) {
        Some(agent) => Ok(agent),
        None => state.storage.get_agent(id).await,
    }
}

/// GET /v1/agents/{id}
#[utoipa::path(
    get,
    path = "/v1/agents/{id}",
    tag = "agents",
    params(("id" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "The agent"),
        (status = 404, description = "Unknown agent"),
    )
)]
pub async fn get_agent(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentInfo>> {
    Ok(Json(find_agent(&state, &id).await?))
}

/// DELETE /v1/agents/{id}
#[utoipa::path(
    delete,
    path = "/v1/agents/{id}",
    tag = "agents",
    params(("id" = String, Path, description = "Agent id")),
    responses(
        (status = 204, description = "Agent and its rows removed"),
        (status = 404, description = "Unknown agent"),
    )
)]
pub async fn delete_agent(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.storage.delete_agent(&id).await?;
    state.registry.remove(&id);
    info!(agent_id = %id, "agent deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/agents/{id}/metrics/latest
#[utoipa::path(
    get,
    path = "/v1/agents/{id}/metrics/latest",
    tag = "agents",
    params(("id" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Newest envelope by timestamp"),
        (status = 404, description = "Agent never reported"),
    )
)]
pub async fn latest_metrics(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MetricsEnvelope>> {
    Ok(Json(state.storage.get_latest_metrics(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangesQuery {
    since: Option<DateTime<Utc>>,
    /// Restrict to one interface
    interface: Option<String>,
}

/// GET /v1/agents/{id}/ip-changes
#[utoipa::path(
    get,
    path = "/v1/agents/{id}/ip-changes",
    tag = "agents",
    params(
        ("id" = String, Path, description = "Agent id"),
        ("since" = Option<String>, Query, description = "RFC 3339; defaults to 24 hours ago"),
        ("interface" = Option<String>, Query, description = "Only changes on this interface"),
    ),
    responses((status = 200, description = "Changes newest first"))
)]
pub async fn ip_changes(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    query: Result<Query<ChangesQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<IpChange>>> {
    let Query(query) = query?;
    let since = query
        .since
        .unwrap_or_else(|| Utc::now() - Duration::hours(DEFAULT_CHANGE_WINDOW_HOURS));

    let changes = match query.interface.as_deref() {
        Some(interface) => {
            state
                .storage
                .get_interface_changes(&id, interface, since)
                .await?
        }
        None => state.storage.get_recent_ip_changes(&id, since).await?,
    };
    Ok(Json(changes))
}

/// GET /v1/agents/{id}/ip-changes/summary
#[utoipa::path(
    get,
    path = "/v1/agents/{id}/ip-changes/summary",
    tag = "agents",
    params(("id" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Change counts per interface"),
        (status = 404, description = "Unknown agent"),
    )
)]
pub async fn ip_change_summary(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<IpChangeSummary>> {
    find_agent(&state, &id).await?;
    Ok(Json(state.storage.get_ip_change_summary(&id).await?))
}
