//! Health check endpoint

use axum::{Json, extract::State};

use crate::api::state::ApiState;
use crate::health::HealthReport;

/// GET /v1/health
///
/// Always 200; load balancers key off `healthy`. Sinks that fail their
/// probe show up as `degraded` without flipping it.
#[utoipa::path(
    get,
    path = "/v1/health",
    tag = "system",
    responses((status = 200, description = "Overall flag plus per-component detail"))
)]
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthReport> {
    Json(state.health.check().await)
}
