//! Global request rate limit (token bucket)

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::json;
use tracing::warn;

use crate::config::ApiRateLimitConfig;

#[derive(Clone)]
pub struct RequestLimiter {
    inner: Arc<DefaultDirectRateLimiter>,
}

impl RequestLimiter {
    /// `None` when the limit is disabled or misconfigured with zero rates
    pub fn from_config(config: &ApiRateLimitConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let rate = NonZeroU32::new(config.requests_per_second)?;
        let burst = NonZeroU32::new(config.burst).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);
        Some(Self {
            inner: Arc::new(RateLimiter::direct(quota)),
        })
    }

    pub fn check(&self) -> bool {
        self.inner.check().is_ok()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RequestLimiter>,
    request: Request,
    next: Next,
) -> Response {
    if limiter.check() {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "request rate limit exceeded");
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": {
                "kind": "rate_limited",
                "message": "too many requests",
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_enforced() {
        let limiter = RequestLimiter::from_config(&ApiRateLimitConfig {
            enabled: true,
            requests_per_second: 1,
            burst: 3,
        })
        .unwrap();
        let allowed = (0..10).filter(|_| limiter.check()).count();
        assert_eq!(allowed, 3);
    }

    #[test]
    fn disabled_yields_none() {
        assert!(RequestLimiter::from_config(&ApiRateLimitConfig::default()).is_none());
    }
}
