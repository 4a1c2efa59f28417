pub mod auth;
pub mod ratelimit;

pub use auth::{Authenticator, auth_middleware};
pub use ratelimit::{RequestLimiter, rate_limit_middleware};
