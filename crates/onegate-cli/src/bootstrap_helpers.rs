use onegate_gateway::GatewayConfig;
use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; otherwise `log_level` sets the default directive.
pub(crate) fn init_tracing(log_level: &str) {
    let default_level = log_level
        .trim()
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

const REDACTED: &str = "<redacted>";

/// Config as JSON with credentials masked.
pub(crate) fn redacted_config(config: &GatewayConfig) -> Value {
    let mut value = serde_json::to_value(config).unwrap_or(Value::Null);
    for field in ["bot_token", "app_secret", "ws_token"] {
        if let Some(slot) = value.get_mut(field) {
            if !slot.is_null() {
                *slot = Value::String(REDACTED.to_string());
            }
        }
    }
    value
}
