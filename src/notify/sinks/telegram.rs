//! Telegram Bot API, one `sendMessage` per configured chat

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{instrument, warn};

use super::require;
use crate::config::TelegramConfig;
use crate::error::{Error, Result};
use crate::notify::template::TemplateLoader;
use crate::notify::transport::{HttpTransport, RetryPolicy};
use crate::notify::{Notifier, SinkType};
use crate::types::AlertEvent;

const OP: &str = "telegram.send";

pub struct TelegramSink {
    config: TelegramConfig,
    transport: HttpTransport,
    templates: Arc<TemplateLoader>,
}

impl TelegramSink {
    pub fn new(config: &TelegramConfig, policy: RetryPolicy, templates: Arc<TemplateLoader>) -> Result<Self> {
        const NEW: &str = "telegram.new";
        require(NEW, "telegram.bot_token", &config.bot_token)?;
        if config.chat_ids.iter().all(|id| id.trim().is_empty()) {
            return Err(Error::invalid_config(NEW, "telegram.chat_ids needs at least one chat"));
        }
        Ok(Self {
            transport: HttpTransport::new(NEW, config.timeout, policy.with_max_retries(config.max_retries))?,
            config: config.clone(),
            templates,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    async fn call(&self, op: &'static str, method: &str, body: &Value) -> Result<Value> {
        let url = self.method_url(method);
        let response = self.transport.send_json(op, |client| client.post(&url).json(body)).await?;
        if response.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = response
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("request not ok");
            return Err(Error::unavailable(op, description.to_string()));
        }
        Ok(response)
    }
}

#[async_trait]
impl Notifier for TelegramSink {
    fn sink_type(&self) -> SinkType {
        SinkType::Telegram
    }

    #[instrument(skip_all, fields(event = event.event_type(), agent_id = event.agent_id()))]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        // Legacy Markdown bolds with single asterisks.
        let text = self
            .templates
            .render_event(SinkType::Telegram, event)?
            .replace("**", "*");

        let mut first_error = None;
        for chat_id in self.config.chat_ids.iter().filter(|id| !id.trim().is_empty()) {
            let body = json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown",
                "disable_web_page_preview": true,
            });
            if let Err(e) = self.call(OP, "sendMessage", &body).await {
                warn!(chat_id = %chat_id, "telegram delivery failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn health(&self) -> Result<()> {
        self.call("telegram.health", "getMe", &json!({})).await.map(|_| ())
    }
}
