//! Tolerant decoding of downstream action requests.
//!
//! Bots disagree on how to encode the same logical field: the correlation id
//! may be a string, an integer, a float, an array or an object, and it may sit
//! under `request_id`, `echo`, or inside `params`. Ids inside `params` may be
//! numbers or strings. Everything is normalised here so later stages see one
//! canonical string per field.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub const REQUEST_ID_FIELD: &str = "request_id";
pub const ECHO_FIELD: &str = "echo";
const NESTED_REQUEST_ID_ALIASES: [&str; 2] = ["request_id", "requestID"];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to parse action message JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("action message must include a non-empty action")]
    MissingAction,
    #[error("action params must be a JSON object, found {0}")]
    ParamsNotAnObject(&'static str),
    #[error("field '{field}' has unsupported type {kind}")]
    UnsupportedType { field: String, kind: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
/// The encodings a loosely typed wire field is accepted in.
pub enum WireValue {
    Text(String),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Array(Vec<Value>),
    Object(Map<String, Value>),
}

impl WireValue {
    /// Classifies a JSON value. `null` is absent; booleans are rejected.
    pub fn from_json(field: &str, value: &Value) -> Result<Option<Self>, DecodeError> {
        let wire = match value {
            Value::Null => return Ok(None),
            Value::Bool(_) => {
                return Err(DecodeError::UnsupportedType {
                    field: field.to_string(),
                    kind: "boolean",
                })
            }
            Value::String(text) => Self::Text(text.clone()),
            Value::Number(number) => {
                if let Some(integer) = number.as_i64() {
                    Self::Integer(integer)
                } else if let Some(unsigned) = number.as_u64() {
                    Self::Unsigned(unsigned)
                } else {
                    Self::Float(number.as_f64().unwrap_or_default())
                }
            }
            Value::Array(items) => Self::Array(items.clone()),
            Value::Object(object) => Self::Object(object.clone()),
        };
        Ok(Some(wire))
    }

    /// Canonical string form: decimal digits for numbers (no exponent, no
    /// fraction), compact JSON for arrays and objects.
    pub fn canonical(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Unsigned(value) => value.to_string(),
            Self::Float(value) => format!("{value:.0}"),
            Self::Array(items) => Value::Array(items.clone()).to_string(),
            Self::Object(object) => Value::Object(object.clone()).to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionParams {
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub message_type: Option<String>,
    pub message: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionMessage {
    pub action: String,
    pub params: ActionParams,
    /// Canonical correlation key, the form used for store lookups.
    pub correlation_key: Option<String>,
    /// Value to report back in `request_id`.
    pub request_id: Option<Value>,
    /// Value to report back in `echo`, exactly as received when present.
    pub echo: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawActionMessage {
    #[serde(default)]
    action: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    echo: Option<Value>,
    #[serde(default)]
    request_id: Option<Value>,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Reads an id param that may be a string or a number.
fn decode_id_param(params: &Map<String, Value>, field: &str) -> Result<Option<String>, DecodeError> {
    let Some(value) = params.get(field) else {
        return Ok(None);
    };
    let id = match WireValue::from_json(field, value)? {
        None => None,
        Some(WireValue::Array(_)) | Some(WireValue::Object(_)) => {
            return Err(DecodeError::UnsupportedType {
                field: field.to_string(),
                kind: json_kind(value),
            })
        }
        Some(wire) => Some(wire.canonical()),
    };
    Ok(id.filter(|id| !id.trim().is_empty()))
}

fn nested_request_id(params: &Map<String, Value>) -> Option<&Value> {
    NESTED_REQUEST_ID_ALIASES
        .iter()
        .find_map(|alias| params.get(*alias).filter(|value| !value.is_null()))
}

pub fn decode_action_message(raw: &str) -> Result<ActionMessage, DecodeError> {
    let frame = serde_json::from_str::<RawActionMessage>(raw)?;
    decode_raw_action(frame)
}

pub fn decode_action_value(value: Value) -> Result<ActionMessage, DecodeError> {
    let frame = serde_json::from_value::<RawActionMessage>(value)?;
    decode_raw_action(frame)
}

fn decode_raw_action(frame: RawActionMessage) -> Result<ActionMessage, DecodeError> {
    let action = frame.action.trim();
    if action.is_empty() {
        return Err(DecodeError::MissingAction);
    }

    let params = match frame.params {
        None => Map::new(),
        Some(Value::Object(object)) => object,
        Some(other) => return Err(DecodeError::ParamsNotAnObject(json_kind(&other))),
    };

    let request_id = frame.request_id.filter(|value| !value.is_null());
    let echo = frame.echo.filter(|value| !value.is_null());
    let (correlation_source, correlation_field) = match (&request_id, &echo) {
        (Some(value), _) => (Some(value.clone()), REQUEST_ID_FIELD),
        (None, Some(value)) => (Some(value.clone()), ECHO_FIELD),
        (None, None) => (nested_request_id(&params).cloned(), "params.request_id"),
    };
    let correlation_key = match &correlation_source {
        Some(value) => WireValue::from_json(correlation_field, value)?.map(|wire| wire.canonical()),
        None => None,
    };

    // A promoted nested id is reported back in canonical form.
    let (request_id, echo) = match (request_id, echo) {
        (Some(request_id), Some(echo)) => (Some(request_id), Some(echo)),
        (Some(request_id), None) => (Some(request_id.clone()), Some(request_id)),
        (None, Some(echo)) => (Some(echo.clone()), Some(echo)),
        (None, None) => {
            let promoted = correlation_key.clone().map(Value::String);
            (promoted.clone(), promoted)
        }
    };

    let decoded_params = ActionParams {
        group_id: decode_id_param(&params, "group_id")?,
        user_id: decode_id_param(&params, "user_id")?,
        channel_id: decode_id_param(&params, "channel_id")?,
        message_type: params
            .get("message_type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        message: params.get("message").filter(|value| !value.is_null()).cloned(),
    };

    Ok(ActionMessage {
        action: action.to_string(),
        params: decoded_params,
        correlation_key,
        request_id,
        echo,
    })
}

/// Best-effort action name for logging frames that failed to decode.
pub fn best_effort_action_name(raw: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(raw).ok()?;
    value
        .get("action")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|action| !action.is_empty())
        .map(str::to_string)
}
