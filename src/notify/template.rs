//! Notification templates
//!
//! Built-in templates are compiled into the binary: HTML for email and
//! Markdown for every chat sink. Templates registered at runtime (or loaded
//! from `notify.templates_dir`) shadow the built-ins for the same
//! `(sink, name)` pair.
//!
//! ## Syntax
//!
//! - `{{Agent.hostname}}` looks up a dotted path in the context
//! - `{{formatBytes Interface.stats.rx_bytes}}` calls a helper
//! - `{{join Change.new_addrs ", "}}` passes string literals
//! - `{{#if Utilization}}...{{else}}...{{/if}}` branches on truthiness
//!
//! Helpers: `formatBytes`, `formatBytesRate`, `formatDuration`, `formatTime`,
//! `formatPercent`, `join`, `toTitle`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::SinkType;
use crate::error::{Error, Result};
use crate::types::AlertEvent;
use crate::util::format_bytes;

const OP: &str = "template.render";

static TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").ok());

const EMAIL_TEMPLATES: [(&str, &str); 4] = [
    ("agent_offline", include_str!("../../templates/email/agent_offline.html")),
    ("network_error", include_str!("../../templates/email/network_error.html")),
    ("high_utilization", include_str!("../../templates/email/high_utilization.html")),
    ("ip_change", include_str!("../../templates/email/ip_change.html")),
];

const MARKDOWN_TEMPLATES: [(&str, &str); 4] = [
    ("agent_offline", include_str!("../../templates/markdown/agent_offline.md")),
    ("network_error", include_str!("../../templates/markdown/network_error.md")),
    ("high_utilization", include_str!("../../templates/markdown/high_utilization.md")),
    ("ip_change", include_str!("../../templates/markdown/ip_change.md")),
];

/// How expression output is escaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escape {
    Html,
    None,
}

impl Escape {
    pub fn for_sink(sink: SinkType) -> Self {
        match sink {
            SinkType::Email => Escape::Html,
            _ => Escape::None,
        }
    }
}

/// Markdown variant of a built-in, used as the plain-text part of emails
pub fn builtin_markdown(name: &str) -> Option<&'static str> {
    MARKDOWN_TEMPLATES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, body)| *body)
}

fn builtin(sink: SinkType, name: &str) -> Option<&'static str> {
    match sink {
        SinkType::Webhook => None,
        SinkType::Email => EMAIL_TEMPLATES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, body)| *body),
        _ => builtin_markdown(name),
    }
}

#[derive(Debug, Default)]
pub struct TemplateLoader {
    overrides: RwLock<HashMap<(SinkType, String), Arc<str>>>,
}

impl TemplateLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template that shadows the built-in for `(sink, name)`
    pub fn register(&self, sink: SinkType, name: impl Into<String>, body: impl Into<String>) {
        let name = name.into();
        debug!(sink = %sink, name, "registering custom template");
        self.overrides
            .write()
            .insert((sink, name), Arc::from(body.into()));
    }

    pub fn has_override(&self, sink: SinkType, name: &str) -> bool {
        self.overrides.read().contains_key(&(sink, name.to_string()))
    }

    /// Custom template if registered, otherwise the built-in
    pub fn get(&self, sink: SinkType, name: &str) -> Option<Arc<str>> {
        if let Some(body) = self.overrides.read().get(&(sink, name.to_string())) {
            return Some(Arc::clone(body));
        }
        builtin(sink, name).map(Arc::from)
    }

    /// Load `<dir>/<sink>/<name>.<ext>` files as overrides
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        const LOAD: &str = "template.load_dir";
        let mut count = 0;

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::invalid_config(LOAD, format!("cannot read {}", dir.display())).with_source(e)
        })?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(sink) = entry.file_name().to_string_lossy().parse::<SinkType>() else {
                continue;
            };
            for file in std::fs::read_dir(entry.path())? {
                let path = file?.path();
                let Some(name) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.split('.').next())
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                else {
                    continue;
                };
                let body = std::fs::read_to_string(&path)?;
                self.register(sink, name, body);
                count += 1;
            }
        }

        info!("loaded {count} custom templates from {}", dir.display());
        Ok(count)
    }

    /// Render the template named after the event type for `sink`
    pub fn render_event(&self, sink: SinkType, event: &AlertEvent) -> Result<String> {
        let name = event.event_type();
        let template = self
            .get(sink, name)
            .ok_or_else(|| Error::not_found(OP, format!("no template '{name}' for {sink}")))?;
        render(&template, &context(event), Escape::for_sink(sink))
    }
}

/// One-line summary used as subject or card title
pub fn title(event: &AlertEvent) -> String {
    match event {
        AlertEvent::AgentOffline { agent } => format!("Agent offline: {}", agent.hostname),
        AlertEvent::NetworkErrors { agent_id, interface } => {
            format!("Network errors on {agent_id}/{}", interface.name)
        }
        AlertEvent::HighUtilization {
            agent_id, interface, ..
        } => format!("High utilization on {agent_id}/{}", interface.name),
        AlertEvent::IpChange { agent, change } => {
            if change.is_external {
                format!("External IP change on {}", agent.hostname)
            } else {
                format!("IP change on {} ({})", agent.hostname, change.interface_name)
            }
        }
    }
}

/// Canonical data dictionary for an event
pub fn context(event: &AlertEvent) -> Value {
    let now = Utc::now();
    let mut ctx = json!({
        "EventType": event.event_type(),
        "AgentID": event.agent_id(),
        "Hostname": event.hostname().unwrap_or(event.agent_id()),
        "Title": title(event),
        "Timestamp": now.to_rfc3339(),
        "Agent": null,
        "Interface": null,
        "Change": null,
        "Utilization": null,
    });

    match event {
        AlertEvent::AgentOffline { agent } => {
            ctx["Agent"] = json!(agent);
            ctx["OfflineFor"] = json!((now - agent.last_seen).num_seconds().max(0));
        }
        AlertEvent::NetworkErrors { agent_id, interface } => {
            ctx["Agent"] = json!({ "id": agent_id, "hostname": agent_id });
            ctx["Interface"] = json!(interface);
        }
        AlertEvent::HighUtilization {
            agent_id,
            interface,
            utilization,
        } => {
            ctx["Agent"] = json!({ "id": agent_id, "hostname": agent_id });
            ctx["Interface"] = json!(interface);
            ctx["Utilization"] = json!(utilization);
        }
        AlertEvent::IpChange { agent, change } => {
            ctx["Agent"] = json!(agent);
            ctx["Change"] = json!(change);
            ctx["Timestamp"] = json!(change.timestamp.to_rfc3339());
        }
    }
    ctx
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Expr(String),
    If {
        cond: String,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug)]
enum Token<'a> {
    Text(&'a str),
    Tag(&'a str),
}

fn tokenize(template: &str) -> Result<Vec<Token<'_>>> {
    let tag = TAG
        .as_ref()
        .ok_or_else(|| Error::internal(OP, "template tag pattern failed to compile"))?;
    let mut tokens = Vec::new();
    let mut last = 0;
    for caps in tag.captures_iter(template) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > last {
            tokens.push(Token::Text(&template[last..whole.start()]));
        }
        tokens.push(Token::Tag(inner.as_str()));
        last = whole.end();
    }
    if last < template.len() {
        tokens.push(Token::Text(&template[last..]));
    }
    Ok(tokens)
}

/// Parse until `{{/if}}` (or `{{else}}`) when inside a block, or until the end
fn parse_block<'a>(
    tokens: &mut std::iter::Peekable<impl Iterator<Item = Token<'a>>>,
    nested: bool,
) -> Result<(Vec<Node>, Option<&'a str>)> {
    let mut nodes = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            Token::Text(text) => nodes.push(Node::Text(text.to_string())),
            Token::Tag(tag) => {
                if let Some(cond) = tag.strip_prefix("#if") {
                    let cond = cond.trim().to_string();
                    let (then, end) = parse_block(tokens, true)?;
                    let otherwise = if end == Some("else") {
                        let (otherwise, end) = parse_block(tokens, true)?;
                        if end != Some("/if") {
                            return Err(Error::invalid_input(OP, "unterminated {{#if}}"));
                        }
                        otherwise
                    } else {
                        Vec::new()
                    };
                    nodes.push(Node::If {
                        cond,
                        then,
                        otherwise,
                    });
                } else if tag == "else" || tag == "/if" {
                    if !nested {
                        return Err(Error::invalid_input(OP, format!("unexpected {{{{{tag}}}}}")));
                    }
                    return Ok((nodes, Some(tag)));
                } else {
                    nodes.push(Node::Expr(tag.to_string()));
                }
            }
        }
    }
    if nested {
        return Err(Error::invalid_input(OP, "unterminated {{#if}}"));
    }
    Ok((nodes, None))
}

/// Split an expression on whitespace, keeping quoted strings together
fn split_args(expr: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in expr.chars() {
        match ch {
            '"' => {
                current.push(ch);
                if quoted {
                    args.push(std::mem::take(&mut current));
                }
                quoted = !quoted;
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn lookup(ctx: &Value, path: &str) -> Value {
    let mut value = ctx;
    for part in path.split('.') {
        value = match value {
            Value::Object(map) => match map.get(part) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match part.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    value.clone()
}

fn resolve(ctx: &Value, arg: &str) -> Value {
    if let Some(literal) = arg.strip_prefix('"').and_then(|a| a.strip_suffix('"')) {
        return Value::String(literal.to_string());
    }
    if let Ok(n) = arg.parse::<f64>() {
        return json!(n);
    }
    lookup(ctx, arg)
}

fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(to_text).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn to_title(s: &str) -> String {
    s.split(|c: char| c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn call_helper(name: &str, args: &[Value]) -> Result<String> {
    let number = |i: usize| args.get(i).and_then(Value::as_f64).unwrap_or(0.0);

    Ok(match name {
        "formatBytes" => format_bytes(number(0)),
        "formatBytesRate" => format!("{}/s", format_bytes(number(0))),
        "formatPercent" => format!("{:.1}%", number(0)),
        "formatDuration" => {
            humantime::format_duration(Duration::from_secs(number(0).max(0.0) as u64)).to_string()
        }
        "formatTime" => {
            let raw = args.first().map(to_text).unwrap_or_default();
            match DateTime::parse_from_rfc3339(&raw) {
                Ok(ts) => ts
                    .with_timezone(&Utc)
                    .format("%Y-%m-%d %H:%M:%S UTC")
                    .to_string(),
                Err(_) => raw,
            }
        }
        "join" => {
            let sep = args.get(1).map(to_text).unwrap_or_else(|| ", ".to_string());
            match args.first() {
                Some(Value::Array(items)) => items.iter().map(to_text).collect::<Vec<_>>().join(&sep),
                Some(other) => to_text(other),
                None => String::new(),
            }
        }
        "toTitle" => to_title(&args.first().map(to_text).unwrap_or_default()),
        other => return Err(Error::invalid_input(OP, format!("unknown helper '{other}'"))),
    })
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn eval(expr: &str, ctx: &Value) -> Result<String> {
    let args = split_args(expr);
    match args.as_slice() {
        [] => Ok(String::new()),
        [path] => Ok(to_text(&resolve(ctx, path))),
        [helper, rest @ ..] => {
            let values: Vec<Value> = rest.iter().map(|a| resolve(ctx, a)).collect();
            call_helper(helper, &values)
        }
    }
}

fn render_nodes(nodes: &[Node], ctx: &Value, escape: Escape, out: &mut String) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Expr(expr) => {
                let value = eval(expr, ctx)?;
                match escape {
                    Escape::Html => out.push_str(&escape_html(&value)),
                    Escape::None => out.push_str(&value),
                }
            }
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if truthy(&resolve(ctx, cond)) { then } else { otherwise };
                render_nodes(branch, ctx, escape, out)?;
            }
        }
    }
    Ok(())
}

/// Render `template` against `ctx`
pub fn render(template: &str, ctx: &Value, escape: Escape) -> Result<String> {
    let mut tokens = tokenize(template)?.into_iter().peekable();
    let (nodes, _) = parse_block(&mut tokens, false)?;
    let mut out = String::with_capacity(template.len());
    render_nodes(&nodes, ctx, escape, &mut out)?;
    Ok(out)
}
