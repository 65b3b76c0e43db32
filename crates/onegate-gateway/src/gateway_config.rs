use std::{path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use onegate_connection::{ConnectionManagerConfig, WsSessionConfig, DEFAULT_USER_AGENT};
use onegate_core::{CorrelationMode, IdAllocation};
use onegate_correlation::{CorrelationStoreConfig, InboundRecorderConfig, TokenStyle};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE: &str = "https://api.sgroup.qq.com";
pub const DEFAULT_WEBHOOK_BIND: &str = "0.0.0.0:15630";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_CLOSE_GRACE_MS: u64 = 300;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
const DEFAULT_CORRELATION_RETENTION_SECS: u64 = 600;
const DEFAULT_CORRELATION_SWEEP_INTERVAL_SECS: u64 = 600;
const DEFAULT_AUTO_REPLY_MESSAGE: &str = "This command is not available.";

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_webhook_bind() -> String {
    DEFAULT_WEBHOOK_BIND.to_string()
}

fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

fn default_close_grace_ms() -> u64 {
    DEFAULT_CLOSE_GRACE_MS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_correlation_retention_secs() -> u64 {
    DEFAULT_CORRELATION_RETENTION_SECS
}

fn default_correlation_sweep_interval_secs() -> u64 {
    DEFAULT_CORRELATION_SWEEP_INTERVAL_SECS
}

fn default_auto_reply_message() -> String {
    DEFAULT_AUTO_REPLY_MESSAGE.to_string()
}

fn default_hash_id() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Gateway settings, read from a JSON file and overridable from the command
/// line.
pub struct GatewayConfig {
    pub app_id: u64,
    pub bot_token: String,
    #[serde(default)]
    pub app_secret: Option<String>,
    pub ws_address: String,
    #[serde(default)]
    pub ws_token: Option<String>,
    /// Overrides `two_way_echo` when present.
    #[serde(default)]
    pub use_request_id: Option<bool>,
    /// Legacy name for `use_request_id`.
    #[serde(default)]
    pub two_way_echo: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_webhook_bind")]
    pub webhook_bind: String,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_correlation_retention_secs")]
    pub correlation_retention_secs: u64,
    #[serde(default = "default_correlation_sweep_interval_secs")]
    pub correlation_sweep_interval_secs: u64,
    /// Hashed ids are stable across restarts; sequential ids are not.
    #[serde(default = "default_hash_id")]
    pub hash_id: bool,
    /// Hand the bot `<app_id>_<user id>` tokens instead of opaque ones.
    #[serde(default)]
    pub numeric_tokens: bool,
    #[serde(default)]
    pub master_ids: Vec<String>,
    #[serde(default)]
    pub command_whitelist: Vec<String>,
    #[serde(default)]
    pub auto_reply: bool,
    #[serde(default = "default_auto_reply_message")]
    pub auto_reply_message: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl GatewayConfig {
    /// Minimal valid config; everything else takes its default.
    pub fn new(app_id: u64, bot_token: impl Into<String>, ws_address: impl Into<String>) -> Self {
        Self {
            app_id,
            bot_token: bot_token.into(),
            app_secret: None,
            ws_address: ws_address.into(),
            ws_token: None,
            use_request_id: None,
            two_way_echo: false,
            api_base: default_api_base(),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            webhook_bind: default_webhook_bind(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            correlation_retention_secs: DEFAULT_CORRELATION_RETENTION_SECS,
            correlation_sweep_interval_secs: DEFAULT_CORRELATION_SWEEP_INTERVAL_SECS,
            hash_id: default_hash_id(),
            numeric_tokens: false,
            master_ids: Vec::new(),
            command_whitelist: Vec::new(),
            auto_reply: false,
            auto_reply_message: default_auto_reply_message(),
            log_level: default_log_level(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_id == 0 {
            bail!("gateway config app_id must be greater than 0");
        }
        if self.bot_token.trim().is_empty() {
            bail!("gateway config bot_token must be non-empty");
        }
        if self.ws_address.trim().is_empty() {
            bail!("gateway config ws_address must be non-empty");
        }
        for (field, value) in [
            ("http_timeout_ms", self.http_timeout_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("close_grace_ms", self.close_grace_ms),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("correlation_retention_secs", self.correlation_retention_secs),
            (
                "correlation_sweep_interval_secs",
                self.correlation_sweep_interval_secs,
            ),
        ] {
            if value == 0 {
                bail!("gateway config {field} must be greater than 0");
            }
        }
        Ok(())
    }

    pub fn app_id_string(&self) -> String {
        self.app_id.to_string()
    }

    pub fn correlation_mode(&self) -> CorrelationMode {
        CorrelationMode::from_use_request_id(self.use_request_id.unwrap_or(self.two_way_echo))
    }

    pub fn id_allocation(&self) -> IdAllocation {
        if self.hash_id {
            IdAllocation::Hashed
        } else {
            IdAllocation::Sequential
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn store_config(&self) -> CorrelationStoreConfig {
        CorrelationStoreConfig {
            retention: Duration::from_secs(self.correlation_retention_secs),
            sweep_interval: Duration::from_secs(self.correlation_sweep_interval_secs),
        }
    }

    pub fn recorder_config(&self) -> InboundRecorderConfig {
        InboundRecorderConfig {
            app_id: self.app_id_string(),
            mode: self.correlation_mode(),
            token_style: if self.numeric_tokens {
                TokenStyle::Numeric
            } else {
                TokenStyle::Opaque
            },
        }
    }

    pub fn connection_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            close_grace: Duration::from_millis(self.close_grace_ms),
        }
    }

    pub fn ws_session_config(&self) -> WsSessionConfig {
        WsSessionConfig {
            address: self.ws_address.trim().to_string(),
            self_id: self.app_id,
            access_token: self
                .ws_token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
        }
    }
}

pub fn parse_gateway_config(raw: &str) -> Result<GatewayConfig> {
    let config =
        serde_json::from_str::<GatewayConfig>(raw).context("failed to parse gateway config JSON")?;
    config.validate()?;
    Ok(config)
}

pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read gateway config {}", path.display()))?;
    parse_gateway_config(&raw).with_context(|| format!("invalid gateway config {}", path.display()))
}
