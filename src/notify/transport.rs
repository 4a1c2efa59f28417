//! Outbound delivery with retry
//!
//! A delivery attempt ends in one of four ways: success, a transient failure
//! worth retrying after backoff, a rate-limit answer carrying its own delay,
//! or a permanent failure. [`with_retry`] drives the attempts; [`HttpTransport`]
//! classifies HTTP responses for the sinks that speak HTTP.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::error::{Error, Result};

/// Longest server-requested delay honoured before a retry
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Backoff unit; retry n waits `n² × base_delay`
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Cancelling abandons any pending retry
    pub cancel: CancellationToken,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            max_retries: config.retry_attempts,
            base_delay: config.retry_delay,
            max_delay: config.max_retry_delay,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop retrying once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sink-level override of the retry count
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        if let Some(n) = max_retries {
            self.max_retries = n;
        }
        self
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = retry.saturating_mul(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Result of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    Retry(Error),
    /// Rate limited: sleep exactly this long before the next attempt
    RetryAfter(Error, Duration),
    Fail(Error),
}

/// Run `attempt` until it succeeds, fails permanently or runs out of retries.
///
/// The closure receives the zero-based attempt number. An attempt in flight
/// always completes; cancellation of the policy's token only cuts short the
/// wait before the next one.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &'static str, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut n = 0;
    loop {
        let (err, delay) = match attempt(n).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(err) => return Err(err),
            Attempt::Retry(err) => (err, policy.backoff(n + 1)),
            Attempt::RetryAfter(err, delay) => (err, delay),
        };

        if n >= policy.max_retries {
            return Err(err);
        }
        n += 1;
        warn!(op, attempt = n, delay_ms = delay.as_millis() as u64, "delivery failed, retrying: {err}");
        tokio::select! {
            _ = policy.cancel.cancelled() => {
                debug!(op, "shutting down, abandoning retries");
                return Err(err);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Shared HTTP client plus response classification
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    policy: RetryPolicy,
}

impl HttpTransport {
    pub fn new(op: &'static str, timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("wameter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::invalid_config(op, "failed to build HTTP client").with_source(e))?;
        Ok(Self { client, policy })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send the request produced by `build` with retry, returning the first
    /// successful response.
    ///
    /// `build` is called once per attempt so every attempt carries identical
    /// headers and body.
    pub async fn send(&self, op: &'static str, build: impl Fn(&Client) -> RequestBuilder) -> Result<Response> {
        with_retry(&self.policy, op, |attempt| {
            let request = build(&self.client);
            async move {
                debug!(op, attempt, "sending request");
                match request.send().await {
                    Ok(response) => classify(op, response).await,
                    Err(e) => {
                        let err = Error::from_reqwest(op, e);
                        if err.kind().is_transient() {
                            Attempt::Retry(err)
                        } else {
                            Attempt::Fail(err)
                        }
                    }
                }
            }
        })
        .await
    }

    /// [`send`](Self::send) and decode the JSON body
    pub async fn send_json(&self, op: &'static str, build: impl Fn(&Client) -> RequestBuilder) -> Result<Value> {
        let response = self.send(op, build).await?;
        let text = response.text().await.map_err(|e| Error::from_reqwest(op, e))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::unavailable(op, "response body is not JSON").with_source(e))
    }
}

async fn classify(op: &'static str, response: Response) -> Attempt<Response> {
    let status = response.status();
    if status.is_success() {
        return Attempt::Done(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let header = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        let delay = header.or_else(|| retry_after_from_body(&body));
        let err = Error::from_status(op, status.as_u16(), &body);
        return match delay {
            Some(delay) => Attempt::RetryAfter(err, delay),
            None => Attempt::Retry(err),
        };
    }

    let body = response.text().await.unwrap_or_default();
    let err = Error::from_status(op, status.as_u16(), &body);
    if status.is_server_error() {
        Attempt::Retry(err)
    } else {
        Attempt::Fail(err)
    }
}

fn retry_after_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())).ok()
}

/// `Retry-After` in delta-seconds, fractional seconds tolerated, capped at
/// [`MAX_RETRY_AFTER`]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    retry_after_secs(value.trim().parse().ok()?)
}

/// Bot APIs put the delay in the body: `{"retry_after": 1.5}` or
/// `{"parameters": {"retry_after": 3}}`
fn retry_after_from_body(body: &str) -> Option<Duration> {
    let value: Value = serde_json::from_str(body).ok()?;
    let secs = value
        .get("retry_after")
        .or_else(|| value.pointer("/parameters/retry_after"))?
        .as_f64()?;
    retry_after_secs(secs)
}
