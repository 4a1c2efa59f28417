//! WeCom (enterprise WeChat) application messages
//!
//! Sending needs an access token from `gettoken`. The token is cached and
//! refreshed once 80% of its advertised lifetime has passed. A send rejected
//! with an expired/invalid token code drops the cache, fetches a fresh token
//! and retries exactly once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::{check_vendor_code, require};
use crate::config::WeChatConfig;
use crate::error::{Error, Result};
use crate::notify::template::TemplateLoader;
use crate::notify::transport::{HttpTransport, RetryPolicy};
use crate::notify::{Notifier, SinkType};
use crate::types::AlertEvent;

const OP: &str = "wechat.send";
const TOKEN_OP: &str = "wechat.token";

/// invalid credential, access_token expired, invalid access_token
const TOKEN_ERRORS: [i64; 3] = [40001, 42001, 40014];

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct WeChatSink {
    config: WeChatConfig,
    transport: HttpTransport,
    templates: Arc<TemplateLoader>,
    token: Mutex<Option<CachedToken>>,
}

impl WeChatSink {
    pub fn new(config: &WeChatConfig, policy: RetryPolicy, templates: Arc<TemplateLoader>) -> Result<Self> {
        const NEW: &str = "wechat.new";
        require(NEW, "wechat.corp_id", &config.corp_id)?;
        require(NEW, "wechat.corp_secret", &config.corp_secret)?;
        if config.agent_id <= 0 {
            return Err(Error::invalid_config(NEW, "wechat.agent_id is required"));
        }
        Ok(Self {
            transport: HttpTransport::new(NEW, config.timeout, policy.with_max_retries(config.max_retries))?,
            config: config.clone(),
            templates,
            token: Mutex::new(None),
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/cgi-bin/{path}", self.config.api_base.trim_end_matches('/'))
    }

    /// Cached token, fetching a new one when missing or due for refresh
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.value.clone());
        }

        let url = self.api("gettoken");
        let body = self
            .transport
            .send_json(TOKEN_OP, |client| {
                client.get(&url).query(&[
                    ("corpid", self.config.corp_id.as_str()),
                    ("corpsecret", self.config.corp_secret.as_str()),
                ])
            })
            .await?;
        let response: TokenResponse = serde_json::from_value(body)?;
        if response.errcode != 0 || response.access_token.is_empty() {
            return Err(Error::new(
                crate::error::ErrorKind::Unauthorized,
                TOKEN_OP,
                format!("token request failed ({}): {}", response.errcode, response.errmsg),
            ));
        }

        let lifetime = Duration::from_secs(response.expires_in.max(1)).mul_f64(0.8);
        debug!(refresh_in_secs = lifetime.as_secs(), "fetched wechat access token");
        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn post_message(&self, token: &str, payload: &Value) -> Result<Value> {
        let url = self.api("message/send");
        self.transport
            .send_json(OP, |client| {
                client
                    .post(&url)
                    .query(&[("access_token", token)])
                    .json(payload)
            })
            .await
    }
}

fn errcode(body: &Value) -> i64 {
    body.get("errcode").and_then(Value::as_i64).unwrap_or(0)
}

#[async_trait]
impl Notifier for WeChatSink {
    fn sink_type(&self) -> SinkType {
        SinkType::WeChat
    }

    #[instrument(skip_all, fields(event = event.event_type(), agent_id = event.agent_id()))]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let payload = json!({
            "touser": self.config.to_user,
            "toparty": self.config.to_party,
            "totag": self.config.to_tag,
            "msgtype": "markdown",
            "agentid": self.config.agent_id,
            "markdown": {
                "content": self.templates.render_event(SinkType::WeChat, event)?,
            },
        });

        let token = self.access_token().await?;
        let mut body = self.post_message(&token, &payload).await?;
        if TOKEN_ERRORS.contains(&errcode(&body)) {
            warn!(errcode = errcode(&body), "wechat token rejected, refreshing");
            self.invalidate_token().await;
            let token = self.access_token().await?;
            body = self.post_message(&token, &payload).await?;
        }
        check_vendor_code(OP, &body, "errcode")
    }

    async fn health(&self) -> Result<()> {
        self.access_token().await.map(|_| ())
    }
}
