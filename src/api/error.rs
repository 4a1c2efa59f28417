//! API error types and conversions

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use crate::error::{Error, ErrorKind};

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// A crate [`Error`] on its way to becoming an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(self.0.kind())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal | ErrorKind::InvalidConfig => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Message safe to show a client. Server-side failures may carry DSNs or
/// upstream bodies, so only a generic text leaves the process.
fn public_message(err: &Error) -> String {
    match err.kind() {
        ErrorKind::Internal | ErrorKind::InvalidConfig => "internal server error".to_string(),
        ErrorKind::Unavailable => "service temporarily unavailable".to_string(),
        ErrorKind::Timeout => "operation timed out".to_string(),
        _ => err.message().to_string(),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(op = self.0.op(), "request failed: {}", self.0);
        } else {
            warn!(op = self.0.op(), "request rejected: {}", self.0);
        }

        let body = Json(json!({
            "error": {
                "kind": self.0.kind(),
                "message": public_message(&self.0),
            }
        }));

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(Error::invalid_input("api.decode", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(Error::invalid_input("api.query", rejection.body_text()))
    }
}
