use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use onegate_gateway::{load_gateway_config, GatewayConfig};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "onegate",
    about = "Gateway between the QQ bot platform and OneBot v11 bots",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "ONEGATE_CONFIG",
        help = "Path to a JSON gateway config. Flags below override its fields."
    )]
    pub config: Option<PathBuf>,

    #[arg(long, env = "ONEGATE_APP_ID", value_parser = parse_positive_u64)]
    pub app_id: Option<u64>,

    #[arg(long, env = "ONEGATE_BOT_TOKEN", hide_env_values = true)]
    pub bot_token: Option<String>,

    #[arg(
        long,
        env = "ONEGATE_APP_SECRET",
        hide_env_values = true,
        help = "App secret used to sign and verify webhook requests"
    )]
    pub app_secret: Option<String>,

    #[arg(
        long,
        env = "ONEGATE_WS_ADDRESS",
        help = "Reverse websocket address of the OneBot bot"
    )]
    pub ws_address: Option<String>,

    #[arg(long, env = "ONEGATE_WS_TOKEN", hide_env_values = true)]
    pub ws_token: Option<String>,

    #[arg(long, env = "ONEGATE_WEBHOOK_BIND")]
    pub webhook_bind: Option<String>,

    #[arg(long, env = "ONEGATE_API_BASE")]
    pub api_base: Option<String>,

    #[arg(
        long,
        env = "ONEGATE_USE_REQUEST_ID",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Correlate replies by request_id tokens instead of echo"
    )]
    pub use_request_id: Option<bool>,

    #[arg(
        long,
        env = "ONEGATE_LOG_LEVEL",
        help = "Default log level when RUST_LOG is unset"
    )]
    pub log_level: Option<String>,

    #[arg(long, help = "Validate the config, print it without secrets and exit")]
    pub check_config: bool,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl Cli {
    /// Config file (when given) with command-line overrides applied.
    pub fn gateway_config(&self) -> Result<GatewayConfig> {
        let mut config = match self.config.as_deref() {
            Some(path) => load_gateway_config(path)?,
            None => {
                let (Some(app_id), Some(bot_token), Some(ws_address)) = (
                    self.app_id,
                    non_empty(&self.bot_token),
                    non_empty(&self.ws_address),
                ) else {
                    bail!("--app-id, --bot-token and --ws-address are required without --config");
                };
                GatewayConfig::new(app_id, bot_token, ws_address)
            }
        };
        if let Some(app_id) = self.app_id {
            config.app_id = app_id;
        }
        if let Some(bot_token) = non_empty(&self.bot_token) {
            config.bot_token = bot_token;
        }
        if let Some(app_secret) = non_empty(&self.app_secret) {
            config.app_secret = Some(app_secret);
        }
        if let Some(ws_address) = non_empty(&self.ws_address) {
            config.ws_address = ws_address;
        }
        if let Some(ws_token) = non_empty(&self.ws_token) {
            config.ws_token = Some(ws_token);
        }
        if let Some(webhook_bind) = non_empty(&self.webhook_bind) {
            config.webhook_bind = webhook_bind;
        }
        if let Some(api_base) = non_empty(&self.api_base) {
            config.api_base = api_base;
        }
        if let Some(use_request_id) = self.use_request_id {
            config.use_request_id = Some(use_request_id);
        }
        if let Some(log_level) = non_empty(&self.log_level) {
            config.log_level = log_level;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tempfile::tempdir;

    use super::Cli;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["onegate"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("parse cli")
    }

    #[test]
    fn functional_flags_alone_build_a_config() {
        let cli = parse(&[
            "--app-id=102005",
            "--bot-token=tok",
            "--ws-address=ws://127.0.0.1:8080/onebot",
            "--use-request-id",
        ]);
        let config = cli.gateway_config().expect("config");
        assert_eq!(config.app_id, 102005);
        assert_eq!(config.use_request_id, Some(true));
        assert_eq!(config.ws_address, "ws://127.0.0.1:8080/onebot");
    }

    #[test]
    fn functional_flags_override_config_file_fields() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("onegate.json");
        std::fs::write(
            &path,
            r#"{"app_id": 1, "bot_token": "file-token", "ws_address": "ws://file", "log_level": "debug"}"#,
        )
        .expect("write config");
        let cli = parse(&[
            "--config",
            path.to_str().expect("utf8 path"),
            "--ws-address",
            "ws://flag",
            "--app-secret",
            "secret",
        ]);
        let config = cli.gateway_config().expect("config");
        assert_eq!(config.bot_token, "file-token");
        assert_eq!(config.ws_address, "ws://flag");
        assert_eq!(config.app_secret.as_deref(), Some("secret"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn regression_missing_required_fields_without_config_file() {
        let cli = parse(&["--app-id=1", "--bot-token= "]);
        let error = cli.gateway_config().expect_err("incomplete");
        assert!(error.to_string().contains("--ws-address"));
    }

    #[test]
    fn regression_zero_app_id_is_rejected_by_parser() {
        assert!(Cli::try_parse_from(["onegate", "--app-id=0"]).is_err());
    }
}
