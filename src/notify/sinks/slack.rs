//! Slack incoming webhook

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::instrument;

use super::require;
use crate::config::SlackConfig;
use crate::error::Result;
use crate::notify::template::{TemplateLoader, title};
use crate::notify::transport::{HttpTransport, RetryPolicy};
use crate::notify::{Notifier, SinkType};
use crate::types::AlertEvent;

const OP: &str = "slack.send";

#[derive(Debug, Serialize)]
pub struct SlackMessage {
    /// Fallback shown in notifications
    pub text: String,
    pub blocks: Vec<Block>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Header { text: Text },
    Section { text: Text },
    Divider,
}

#[derive(Debug, Serialize)]
pub struct Text {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

impl Text {
    fn plain(text: impl Into<String>) -> Self {
        Self {
            kind: "plain_text",
            text: text.into(),
        }
    }

    fn mrkdwn(text: impl Into<String>) -> Self {
        Self {
            kind: "mrkdwn",
            text: text.into(),
        }
    }
}

pub struct SlackSink {
    config: SlackConfig,
    transport: HttpTransport,
    templates: Arc<TemplateLoader>,
}

impl SlackSink {
    pub fn new(config: &SlackConfig, policy: RetryPolicy, templates: Arc<TemplateLoader>) -> Result<Self> {
        require("slack.new", "slack.webhook_url", &config.webhook_url)?;
        Ok(Self {
            transport: HttpTransport::new("slack.new", config.timeout, policy.with_max_retries(config.max_retries))?,
            config: config.clone(),
            templates,
        })
    }

    pub fn message(&self, event: &AlertEvent) -> Result<SlackMessage> {
        let summary = title(event);
        let body = self.templates.render_event(SinkType::Slack, event)?;
        Ok(SlackMessage {
            text: summary.clone(),
            blocks: vec![
                Block::Header {
                    text: Text::plain(summary),
                },
                Block::Section {
                    text: Text::mrkdwn(to_mrkdwn(&body)),
                },
                Block::Divider,
            ],
            channel: self.config.channel.clone(),
            username: self.config.username.clone(),
        })
    }
}

/// Slack bolds with single asterisks
fn to_mrkdwn(markdown: &str) -> String {
    markdown.replace("**", "*")
}

#[async_trait]
impl Notifier for SlackSink {
    fn sink_type(&self) -> SinkType {
        SinkType::Slack
    }

    #[instrument(skip_all, fields(event = event.event_type(), agent_id = event.agent_id()))]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let message = self.message(event)?;
        self.transport
            .send(OP, |client| client.post(&self.config.webhook_url).json(&message))
            .await?;
        Ok(())
    }
}
