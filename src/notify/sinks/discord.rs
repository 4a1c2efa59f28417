use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use super::require;
use crate::config::DiscordConfig;
use crate::error::Result;
use crate::notify::template::{TemplateLoader, title};
use crate::notify::transport::{HttpTransport, RetryPolicy};
use crate::notify::{Notifier, SinkType};
use crate::types::AlertEvent;
use crate::util::format_bytes;

const OP: &str = "discord.send";

// Discord caps embed descriptions at 4096 characters.
const MAX_DESCRIPTION: usize = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

pub struct DiscordSink {
    config: DiscordConfig,
    transport: HttpTransport,
    templates: Arc<TemplateLoader>,
}

impl DiscordSink {
    pub fn new(config: &DiscordConfig, policy: RetryPolicy, templates: Arc<TemplateLoader>) -> Result<Self> {
        require("discord.new", "discord.webhook_url", &config.webhook_url)?;
        Ok(Self {
            transport: HttpTransport::new(
                "discord.new",
                config.timeout,
                policy.with_max_retries(config.max_retries),
            )?,
            config: config.clone(),
            templates,
        })
    }

    pub fn message(&self, event: &AlertEvent) -> Result<Message> {
        let mut description = self.templates.render_event(SinkType::Discord, event)?;
        if description.chars().count() > MAX_DESCRIPTION {
            description = description.chars().take(MAX_DESCRIPTION - 3).collect::<String>() + "...";
        }

        let embed = Embed {
            title: Some(title(event)),
            description: Some(description),
            color: Some(color(event)),
            fields: fields(event),
            footer: Some(EmbedFooter {
                text: format!("Agent: {}", event.agent_id()),
            }),
            timestamp: Some(Utc::now().to_rfc3339()),
        };

        let mut builder = MessageBuilder::new().add_embed(embed);
        if let Some(user_id) = self.config.user_id.as_deref().filter(|id| !id.is_empty()) {
            builder = builder.content(format!("<@{user_id}>"));
        }
        Ok(builder.build())
    }
}

fn color(event: &AlertEvent) -> u32 {
    match event {
        AlertEvent::AgentOffline { .. } => 15158332,     // Red
        AlertEvent::NetworkErrors { .. } => 15105570,    // Orange
        AlertEvent::HighUtilization { .. } => 16776960,  // Yellow
        AlertEvent::IpChange { .. } => 3447003,          // Blue
    }
}

fn fields(event: &AlertEvent) -> Vec<EmbedField> {
    let field = |name: &str, value: String, inline: bool| EmbedField {
        name: name.to_string(),
        value,
        inline,
    };

    match event {
        AlertEvent::AgentOffline { agent } => vec![
            field("Hostname", agent.hostname.clone(), true),
            field("Last seen", agent.last_seen.to_rfc3339(), true),
        ],
        AlertEvent::NetworkErrors { interface, .. } => {
            let stats = interface.stats.clone().unwrap_or_default();
            vec![
                field("Interface", interface.name.clone(), true),
                field("RX errors", stats.rx_errors.to_string(), true),
                field("TX errors", stats.tx_errors.to_string(), true),
            ]
        }
        AlertEvent::HighUtilization {
            interface, utilization, ..
        } => {
            let stats = interface.stats.clone().unwrap_or_default();
            let mut fields = vec![
                field("Interface", interface.name.clone(), true),
                field("RX", format!("{}/s", format_bytes(stats.rx_bytes_rate)), true),
                field("TX", format!("{}/s", format_bytes(stats.tx_bytes_rate)), true),
            ];
            if let Some(percent) = utilization {
                fields.push(field("Utilization", format!("{percent:.1}%"), false));
            }
            fields
        }
        AlertEvent::IpChange { change, .. } => vec![
            field(
                "Interface",
                if change.is_external {
                    "external".to_string()
                } else {
                    change.interface_name.clone()
                },
                true,
            ),
            field("Old", change.old_addrs.join(", "), false),
            field("New", change.new_addrs.join(", "), false),
        ],
    }
}

#[async_trait]
impl Notifier for DiscordSink {
    fn sink_type(&self) -> SinkType {
        SinkType::Discord
    }

    #[instrument(skip_all, fields(event = event.event_type(), agent_id = event.agent_id()))]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let message = self.message(event)?;
        self.transport
            .send(OP, |client| client.post(&self.config.webhook_url).json(&message))
            .await?;
        info!("Successfully sent Discord message");
        Ok(())
    }
}
