use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
/// Anything a JSON payload can be pushed to towards the downstream bot.
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, payload: Value) -> Result<()>;
}
