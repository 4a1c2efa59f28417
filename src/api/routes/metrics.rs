//! Report ingestion and metric queries

use axum::{
    Json,
    extract::{Query, State, rejection::{JsonRejection, QueryRejection}},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::{error::ApiResult, state::ApiState};
use crate::error::Error;
use crate::ingest::BatchResult;
use crate::storage::{MAX_QUERY_LIMIT, QueryParams};
use crate::types::MetricsEnvelope;

/// POST /v1/metrics
#[utoipa::path(
    post,
    path = "/v1/metrics",
    tag = "metrics",
    responses(
        (status = 202, description = "Report accepted"),
        (status = 400, description = "Malformed or invalid report"),
    )
)]
pub async fn ingest_report(
    State(state): State<ApiState>,
    body: Result<Json<MetricsEnvelope>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(envelope) = body?;
    state.ingest.ingest(envelope).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /v1/metrics:batch
#[utoipa::path(
    post,
    path = "/v1/metrics:batch",
    tag = "metrics",
    responses(
        (status = 202, description = "Per-item status; valid items persisted in one transaction"),
        (status = 400, description = "Body is not an array of reports"),
    )
)]
pub async fn ingest_batch(
    State(state): State<ApiState>,
    body: Result<Json<Vec<MetricsEnvelope>>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<BatchResult>)> {
    let Json(envelopes) = body?;
    let result = state.ingest.ingest_batch(envelopes).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

/// Query parameters for `GET /v1/metrics`
#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    /// Comma separated agent ids; all agents when absent
    agent_ids: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

impl MetricsQuery {
    fn into_params(self) -> Result<QueryParams, Error> {
        const OP: &str = "api.query_metrics";
        if self.limit == Some(0) {
            return Err(Error::invalid_input(OP, "limit must be positive"));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(Error::invalid_input(OP, "start is after end"));
            }
        }

        let agent_ids = self
            .agent_ids
            .map(|ids| {
                ids.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(QueryParams {
            agent_ids,
            start: self.start,
            end: self.end,
            limit: self.limit.map(|limit| limit.min(MAX_QUERY_LIMIT)),
            offset: self.offset,
            ..Default::default()
        })
    }
}

/// GET /v1/metrics
#[utoipa::path(
    get,
    path = "/v1/metrics",
    tag = "metrics",
    params(
        ("agent_ids" = Option<String>, Query, description = "Comma separated agent ids"),
        ("start" = Option<String>, Query, description = "RFC 3339 lower bound on timestamp"),
        ("end" = Option<String>, Query, description = "RFC 3339 upper bound on timestamp"),
        ("limit" = Option<usize>, Query, description = "Clamped to 10000"),
    ),
    responses(
        (status = 200, description = "Matching envelopes"),
        (status = 400, description = "Invalid query"),
    )
)]
pub async fn query_metrics(
    State(state): State<ApiState>,
    query: Result<Query<MetricsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<MetricsEnvelope>>> {
    let Query(query) = query?;
    let params = query.into_params()?;
    Ok(Json(state.storage.query_metrics(&params).await?))
}
