//! Request authentication
//!
//! One of three schemes, chosen by `api.auth.type`:
//!
//! - `jwt`: `Authorization: Bearer <token>`, HS256, issued by `/v1/auth/token`
//! - `api_key`: `X-API-Key: <key>` (or the key as a bearer token)
//! - `basic`: `Authorization: Basic <base64(user:password)>` against `allowed_users`

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::error::ApiError;
use crate::config::{AuthConfig, AuthType, UserCredential};
use crate::error::{Error, ErrorKind, Result};

pub const API_KEY_HEADER: &str = "x-api-key";

const OP: &str = "api.auth";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly issued bearer token
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
}

struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

pub struct Authenticator {
    kind: AuthType,
    jwt: Option<JwtKeys>,
    jwt_duration: Duration,
    users: Vec<UserCredential>,
    api_keys: Vec<String>,
}

fn unauthorized(message: &str) -> Error {
    Error::new(ErrorKind::Unauthorized, OP, message)
}

impl Authenticator {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let jwt = match (config.kind, config.jwt_secret.as_deref()) {
            (AuthType::Jwt, Some(secret)) if !secret.is_empty() => Some(JwtKeys {
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
            }),
            (AuthType::Jwt, _) => {
                return Err(Error::invalid_config(OP, "jwt auth requires jwt_secret"));
            }
            _ => None,
        };

        Ok(Self {
            kind: config.kind,
            jwt,
            jwt_duration: config.jwt_duration,
            users: config.allowed_users.clone(),
            api_keys: config.api_keys.clone(),
        })
    }

    /// Authenticator that lets every request through
    pub fn disabled() -> Self {
        Self {
            kind: AuthType::None,
            jwt: None,
            jwt_duration: Duration::ZERO,
            users: Vec::new(),
            api_keys: Vec::new(),
        }
    }

    pub fn kind(&self) -> AuthType {
        self.kind
    }

    fn check_user(&self, username: &str, password: &str) -> bool {
        self.users
            .iter()
            .any(|u| u.username == username && u.password == password)
    }

    /// Exchange user credentials for a JWT; only available with `jwt` auth
    pub fn issue_token(&self, username: &str, password: &str, now: DateTime<Utc>) -> Result<IssuedToken> {
        let Some(keys) = &self.jwt else {
            return Err(Error::not_found(OP, "token issuing requires jwt authentication"));
        };
        if !self.check_user(username, password) {
            return Err(unauthorized("invalid username or password"));
        }

        let lifetime = chrono::Duration::from_std(self.jwt_duration)
            .map_err(|e| Error::invalid_config(OP, "jwt_duration out of range").with_source(e))?;
        let expires_at = now + lifetime;
        let claims = Claims {
            sub: username.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| Error::internal(OP, "failed to sign token").with_source(e))?;

        debug!(user = username, "issued token");
        Ok(IssuedToken {
            token,
            token_type: "Bearer",
            expires_at,
        })
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let Some(keys) = &self.jwt else {
            return Err(unauthorized("jwt authentication is not configured"));
        };
        decode::<Claims>(token, &keys.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => unauthorized("token expired"),
                _ => unauthorized("invalid token"),
            })
    }

    /// Check the request headers against the configured scheme
    pub fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        match self.kind {
            AuthType::None => Ok(()),
            AuthType::Jwt => {
                let token = authorization
                    .ok_or_else(|| unauthorized("missing Authorization header"))?
                    .strip_prefix("Bearer ")
                    .ok_or_else(|| unauthorized("expected a Bearer token"))?;
                self.verify_token(token.trim()).map(|_| ())
            }
            AuthType::ApiKey => {
                let key = headers
                    .get(API_KEY_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .or_else(|| authorization.and_then(|v| v.strip_prefix("Bearer ")))
                    .ok_or_else(|| unauthorized("missing API key"))?;
                if self.api_keys.iter().any(|k| k == key.trim()) {
                    Ok(())
                } else {
                    Err(unauthorized("invalid API key"))
                }
            }
            AuthType::Basic => {
                let encoded = authorization
                    .ok_or_else(|| unauthorized("missing Authorization header"))?
                    .strip_prefix("Basic ")
                    .ok_or_else(|| unauthorized("expected Basic credentials"))?;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .ok_or_else(|| unauthorized("malformed Basic credentials"))?;
                let (user, password) = decoded
                    .split_once(':')
                    .ok_or_else(|| unauthorized("malformed Basic credentials"))?;
                if self.check_user(user, password) {
                    Ok(())
                } else {
                    Err(unauthorized("invalid username or password"))
                }
            }
        }
    }
}

/// Authentication middleware for the protected routes
pub async fn auth_middleware(
    State(auth): State<Arc<Authenticator>>,
    request: Request,
    next: Next,
) -> Response {
    match auth.authorize(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(e) => ApiError(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config(kind: AuthType) -> AuthConfig {
        AuthConfig {
            kind,
            jwt_secret: Some("s3cret".into()),
            jwt_duration: Duration::from_secs(3600),
            allowed_users: vec![UserCredential {
                username: "admin".into(),
                password: "hunter2".into(),
            }],
            api_keys: vec!["key-1".into()],
        }
    }

    fn headers(name: &str, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        map
    }

    #[test]
    fn issued_jwt_is_accepted() {
        let auth = Authenticator::from_config(&config(AuthType::Jwt)).unwrap();
        let issued = auth.issue_token("admin", "hunter2", Utc::now()).unwrap();
        let h = headers("authorization", &format!("Bearer {}", issued.token));
        assert!(auth.authorize(&h).is_ok());
        assert_eq!(auth.verify_token(&issued.token).unwrap().sub, "admin");
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let auth = Authenticator::from_config(&config(AuthType::Jwt)).unwrap();
        let issued = auth
            .issue_token("admin", "hunter2", Utc::now() - chrono::Duration::hours(3))
            .unwrap();
        let err = auth.verify_token(&issued.token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.message(), "token expired");
    }

    #[test]
    fn wrong_password_gets_no_token() {
        let auth = Authenticator::from_config(&config(AuthType::Jwt)).unwrap();
        let err = auth.issue_token("admin", "nope", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn api_key_header_or_bearer() {
        let auth = Authenticator::from_config(&config(AuthType::ApiKey)).unwrap();
        assert!(auth.authorize(&headers("x-api-key", "key-1")).is_ok());
        assert!(auth.authorize(&headers("authorization", "Bearer key-1")).is_ok());
        assert!(auth.authorize(&headers("x-api-key", "key-2")).is_err());
        assert!(auth.authorize(&HeaderMap::new()).is_err());
    }

    #[test]
    fn basic_credentials() {
        let auth = Authenticator::from_config(&config(AuthType::Basic)).unwrap();
        let good = base64::engine::general_purpose::STANDARD.encode("admin:hunter2");
        let bad = base64::engine::general_purpose::STANDARD.encode("admin:wrong");
        assert!(auth.authorize(&headers("authorization", &format!("Basic {good}"))).is_ok());
        assert!(auth.authorize(&headers("authorization", &format!("Basic {bad}"))).is_err());
        assert!(auth.authorize(&headers("authorization", "Basic !!!")).is_err());
    }

    #[test]
    fn none_allows_everything() {
        assert!(Authenticator::disabled().authorize(&HeaderMap::new()).is_ok());
    }
}
