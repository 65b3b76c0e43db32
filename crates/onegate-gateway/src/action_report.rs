//! Result frames written back to the downstream bot after an action.

use onegate_core::CorrelationMode;
use onegate_dispatch::{ActionMessage, ECHO_FIELD, REQUEST_ID_FIELD};
use serde_json::{json, Map, Value};

use crate::upstream_api::{FailureClass, UpstreamApiError};

pub const STATUS_OK: &str = "ok";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, PartialEq)]
pub struct ActionReport {
    pub status: &'static str,
    pub retcode: i64,
    pub message: String,
    pub data: Value,
}

impl ActionReport {
    pub fn ok(data: Value) -> Self {
        Self {
            status: STATUS_OK,
            retcode: 0,
            message: String::new(),
            data,
        }
    }

    pub fn sent(message_id: Option<i64>) -> Self {
        Self::ok(json!({ "message_id": message_id.unwrap_or_default() }))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_FAILED,
            retcode: -1,
            message: message.into(),
            data: Value::Null,
        }
    }

    /// Soft failures are reported as delivered, with the platform message kept
    /// for the bot's logs.
    pub fn from_upstream_error(error: &UpstreamApiError) -> Self {
        match error.classify() {
            FailureClass::Soft => Self {
                message: error.sanitized_message(),
                ..Self::sent(None)
            },
            FailureClass::Real => Self::failed(error.sanitized_message()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.retcode == 0
    }

    /// Wire frame for `mode`. Only one of `request_id` and `echo` is written.
    pub fn to_frame(&self, mode: CorrelationMode, action: &ActionMessage) -> Value {
        let mut frame = Map::new();
        frame.insert("status".to_string(), Value::String(self.status.to_string()));
        frame.insert("retcode".to_string(), Value::from(self.retcode));
        frame.insert("message".to_string(), Value::String(self.message.clone()));
        frame.insert("data".to_string(), self.data.clone());
        match mode {
            CorrelationMode::RequestId => {
                if let Some(key) = action.correlation_key.as_ref() {
                    frame.insert(REQUEST_ID_FIELD.to_string(), Value::String(key.clone()));
                }
            }
            CorrelationMode::Echo => {
                if let Some(echo) = action.echo.as_ref() {
                    frame.insert(ECHO_FIELD.to_string(), echo.clone());
                }
            }
        }
        Value::Object(frame)
    }
}
