//! Token issuing

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use chrono::Utc;
use serde::Deserialize;

use crate::api::{error::ApiResult, middleware::auth::IssuedToken, state::ApiState};

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

/// POST /v1/auth/token
#[utoipa::path(
    post,
    path = "/v1/auth/token",
    tag = "auth",
    responses(
        (status = 200, description = "HS256 bearer token"),
        (status = 401, description = "Unknown user or wrong password"),
        (status = 404, description = "JWT authentication is not enabled"),
    )
)]
pub async fn issue_token(
    State(state): State<ApiState>,
    body: Result<Json<TokenRequest>, JsonRejection>,
) -> ApiResult<Json<IssuedToken>> {
    let Json(request) = body?;
    let token = state
        .auth
        .issue_token(&request.username, &request.password, Utc::now())?;
    Ok(Json(token))
}
