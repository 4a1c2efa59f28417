use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::trace;

use crate::alerts::AlertThresholds;
use crate::error::{Error, Result};

/// Serde helpers for human readable durations such as `"30s"` or `"1h 30m"`.
/// Bare integers are taken as seconds.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(de::Error::custom),
        }
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(deserialize_with = "super::deserialize")] Duration);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(d)| d))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub notify: NotifyConfig,
    pub api: ApiConfig,
    pub agents: AgentsConfig,
    pub ingest: IngestConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: SocketAddr,
    #[serde(with = "duration_str")]
    pub read_timeout: Duration,
    #[serde(with = "duration_str")]
    pub write_timeout: Duration,
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub client_ca: Option<PathBuf>,
    /// "1.2" or "1.3"
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub require_client_cert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub driver: StorageDriver,
    pub dsn: String,
    pub max_connections: u32,
    pub max_idle_conns: u32,
    #[serde(with = "duration_str")]
    pub conn_max_lifetime: Duration,
    #[serde(with = "duration_str")]
    pub query_timeout: Duration,
    /// Rows per cleanup batch; the driver picks its own default when unset
    pub max_batch_size: Option<usize>,
    #[serde(with = "duration_str")]
    pub batch_pause: Duration,
    pub statement_cache: bool,
    pub enable_metrics: bool,
    #[serde(with = "duration_str")]
    pub slow_query_time: Duration,
    pub enable_pruning: bool,
    #[serde(with = "duration_str")]
    pub prune_interval: Duration,
    #[serde(with = "duration_str")]
    pub metrics_retention: Duration,
    #[serde(with = "duration_str")]
    pub ping_interval: Duration,
    pub auto_migrate: bool,
    pub migrations_path: Option<PathBuf>,
    pub rollback_steps: u32,
    pub target_version: Option<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: StorageDriver::Sqlite,
            dsn: "./wameter.db".to_string(),
            max_connections: 10,
            max_idle_conns: 2,
            conn_max_lifetime: Duration::from_secs(3600),
            query_timeout: Duration::from_secs(60),
            max_batch_size: None,
            batch_pause: Duration::from_millis(50),
            statement_cache: true,
            enable_metrics: true,
            slow_query_time: Duration::from_secs(1),
            enable_pruning: true,
            prune_interval: Duration::from_secs(3600),
            metrics_retention: Duration::from_secs(30 * 24 * 3600),
            ping_interval: Duration::from_secs(30),
            auto_migrate: true,
            migrations_path: None,
            rollback_steps: 0,
            target_version: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub retry_attempts: u32,
    /// Backoff unit: attempt n waits `n² × retry_delay`
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_retry_delay: Duration,
    /// Capacity of each per-sink worker queue
    pub max_batch_size: usize,
    /// Capacity of the dispatcher queue
    pub queue_capacity: usize,
    pub rate_limit: RateLimitConfig,
    pub thresholds: AlertThresholds,
    pub templates_dir: Option<PathBuf>,

    pub email: Option<EmailConfig>,
    pub webhook: Option<WebhookConfig>,
    pub slack: Option<SlackConfig>,
    pub discord: Option<DiscordConfig>,
    pub telegram: Option<TelegramConfig>,
    pub dingtalk: Option<DingTalkConfig>,
    pub wechat: Option<WeChatConfig>,
    pub feishu: Option<FeishuConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            max_batch_size: 100,
            queue_capacity: 100,
            rate_limit: RateLimitConfig::default(),
            thresholds: AlertThresholds::default(),
            templates_dir: None,
            email: None,
            webhook: None,
            slack: None,
            discord: None,
            telegram: None,
            dingtalk: None,
            wechat: None,
            feishu: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    #[serde(with = "duration_str")]
    pub interval: Duration,
    pub max_events: usize,
    /// One bucket per sink; otherwise all sinks share a bucket
    pub per_channel: bool,
    /// Split each bucket further by agent id
    pub per_agent: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60),
            max_events: 10,
            per_channel: true,
            per_agent: false,
        }
    }
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    #[default]
    Starttls,
    Tls,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub security: SmtpSecurity,
    #[serde(default = "default_sink_timeout", with = "duration_str")]
    pub timeout: Duration,
    pub max_retries: Option<u32>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: String,
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Merged into every request body
    #[serde(default)]
    pub common_data: Map<String, Value>,
    #[serde(default = "default_sink_timeout", with = "duration_str")]
    pub timeout: Duration,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,
    pub channel: Option<String>,
    pub username: Option<String>,
    #[serde(default = "default_sink_timeout", with = "duration_str")]
    pub timeout: Duration,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,
    /// Mentioned in the message content when set
    pub user_id: Option<String>,
    #[serde(default = "default_sink_timeout", with = "duration_str")]
    pub timeout: Duration,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bot_token: String,
    #[serde(default)]
    pub chat_ids: Vec<String>,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    #[serde(default = "default_sink_timeout", with = "duration_str")]
    pub timeout: Duration,
    pub max_retries: Option<u32>,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DingTalkConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,
    pub secret: Option<String>,
    #[serde(default)]
    pub at_mobiles: Vec<String>,
    #[serde(default)]
    pub at_all: bool,
    #[serde(default = "default_sink_timeout", with = "duration_str")]
    pub timeout: Duration,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeChatConfig {
    #[serde(default)]
    pub enabled: bool,
    pub corp_id: String,
    pub corp_secret: String,
    pub agent_id: i64,
    #[serde(default = "default_wechat_to_user")]
    pub to_user: String,
    #[serde(default)]
    pub to_party: String,
    #[serde(default)]
    pub to_tag: String,
    #[serde(default = "default_wechat_api")]
    pub api_base: String,
    #[serde(default = "default_sink_timeout", with = "duration_str")]
    pub timeout: Duration,
    pub max_retries: Option<u32>,
}

fn default_wechat_to_user() -> String {
    "@all".to_string()
}

fn default_wechat_api() -> String {
    "https://qyapi.weixin.qq.com".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeishuConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,
    pub secret: Option<String>,
    #[serde(default = "default_sink_timeout", with = "duration_str")]
    pub timeout: Duration,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub auth: AuthConfig,
    pub cors: CorsConfig,
    pub rate_limit: ApiRateLimitConfig,
    pub docs: DocsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    Jwt,
    ApiKey,
    Basic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub kind: AuthType,
    pub jwt_secret: Option<String>,
    #[serde(with = "duration_str")]
    pub jwt_duration: Duration,
    pub allowed_users: Vec<UserCredential>,
    pub api_keys: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            kind: AuthType::None,
            jwt_secret: None,
            jwt_duration: Duration::from_secs(24 * 3600),
            allowed_users: Vec::new(),
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Any origin when empty
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiRateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst: u32,
}

impl Default for ApiRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 50,
            burst: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocsConfig {
    pub enabled: bool,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    #[serde(with = "duration_str")]
    pub offline_threshold: Duration,
    #[serde(with = "duration_str")]
    pub check_interval: Duration,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            offline_threshold: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Reject reports stamped further than this into the future
    #[serde(with = "duration_str::option")]
    pub max_future_skew: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Full filter directive, e.g. `wameter=debug,sqlx=warn`
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            filter: None,
        }
    }
}

impl Config {
    /// Reject combinations the server cannot start with
    pub fn validate(&self) -> Result<()> {
        const OP: &str = "config.validate";

        let tls = &self.server.tls;
        if tls.enabled {
            if tls.cert_file.is_none() || tls.key_file.is_none() {
                return Err(Error::invalid_config(OP, "tls requires cert_file and key_file"));
            }
            if tls.require_client_cert && tls.client_ca.is_none() {
                return Err(Error::invalid_config(
                    OP,
                    "require_client_cert needs a client_ca bundle",
                ));
            }
            for version in [&tls.min_version, &tls.max_version].into_iter().flatten() {
                if !matches!(version.as_str(), "1.2" | "1.3") {
                    return Err(Error::invalid_config(
                        OP,
                        format!("unsupported tls version '{version}'"),
                    ));
                }
            }
        }

        if self.storage.driver == StorageDriver::Sqlite && self.storage.dsn.trim().is_empty() {
            return Err(Error::invalid_config(OP, "storage.dsn must not be empty"));
        }
        if self.storage.max_connections == 0 {
            return Err(Error::invalid_config(OP, "storage.max_connections must be positive"));
        }
        if self.storage.max_batch_size == Some(0) {
            return Err(Error::invalid_config(OP, "storage.max_batch_size must be positive"));
        }
        if self.storage.enable_pruning && self.storage.prune_interval.is_zero() {
            return Err(Error::invalid_config(OP, "storage.prune_interval must be positive"));
        }

        let notify = &self.notify;
        if notify.queue_capacity == 0 || notify.max_batch_size == 0 {
            return Err(Error::invalid_config(OP, "notification queues need a capacity"));
        }
        if notify.rate_limit.enabled
            && (notify.rate_limit.max_events == 0 || notify.rate_limit.interval.is_zero())
        {
            return Err(Error::invalid_config(
                OP,
                "rate_limit needs a positive interval and max_events",
            ));
        }

        let auth = &self.api.auth;
        match auth.kind {
            AuthType::None => {}
            AuthType::Jwt => {
                if auth.jwt_secret.as_deref().unwrap_or_default().is_empty() {
                    return Err(Error::invalid_config(OP, "jwt auth requires jwt_secret"));
                }
            }
            AuthType::ApiKey => {
                if auth.api_keys.is_empty() {
                    return Err(Error::invalid_config(OP, "api_key auth requires api_keys"));
                }
            }
            AuthType::Basic => {
                if auth.allowed_users.is_empty() {
                    return Err(Error::invalid_config(OP, "basic auth requires allowed_users"));
                }
            }
        }
        if self.api.rate_limit.enabled && self.api.rate_limit.requests_per_second == 0 {
            return Err(Error::invalid_config(OP, "api.rate_limit.requests_per_second must be positive"));
        }

        if self.agents.offline_threshold.is_zero() || self.agents.check_interval.is_zero() {
            return Err(Error::invalid_config(OP, "agent liveness durations must be positive"));
        }

        Ok(())
    }

    /// Environment overrides, applied after the file is parsed
    pub fn apply_env(&mut self) {
        if let Some(addr) = crate::util::get_addr() {
            self.server.address = addr;
        }
        if let Some(dsn) = crate::util::get_storage_dsn() {
            self.storage.dsn = dsn;
        }
    }
}

/// Parse a config file. `.toml` files are read as TOML, anything else as JSON.
pub fn parse_config(path: &Path, content: &str) -> Result<Config> {
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    if is_toml {
        toml::from_str(content).map_err(|e| {
            Error::invalid_config("config.parse", format!("invalid TOML configuration: {e}"))
        })
    } else {
        serde_json::from_str(content).map_err(|e| {
            Error::invalid_config("config.parse", format!("invalid JSON configuration: {e}"))
        })
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path).map_err(|e| {
        Error::invalid_config(
            "config.read",
            format!("cannot read configuration file {}", path.display()),
        )
        .with_source(e)
    })?;

    let mut config = parse_config(path, &file_content)?;
    config.apply_env();
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}
