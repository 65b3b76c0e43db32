//! HTTP ingress for upstream platform events.
//!
//! `POST /webhook` answers the URL validation challenge (op 13) and hands
//! message dispatches (op 0) to the [`EventForwarder`]. Requests are
//! signature-checked when an app secret is configured.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use onegate_core::ConversationKind;
use onegate_correlation::InboundMessageEvent;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    action_handlers::ConnectionStatus, event_forwarder::EventForwarder,
    message_content::strip_leading_mentions,
};

pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";
pub const SIGNATURE_TIMESTAMP_HEADER: &str = "x-signature-timestamp";

const OP_DISPATCH: u8 = 0;
const OP_HTTP_CALLBACK_ACK: u8 = 12;
const OP_CALLBACK_VALIDATION: u8 = 13;

pub const GROUP_AT_MESSAGE_CREATE: &str = "GROUP_AT_MESSAGE_CREATE";
pub const C2C_MESSAGE_CREATE: &str = "C2C_MESSAGE_CREATE";
pub const AT_MESSAGE_CREATE: &str = "AT_MESSAGE_CREATE";
pub const DIRECT_MESSAGE_CREATE: &str = "DIRECT_MESSAGE_CREATE";

/// Ed25519 key derived from the bot's app secret.
#[derive(Clone)]
pub struct WebhookSigner {
    signing_key: SigningKey,
}

impl std::fmt::Debug for WebhookSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSigner").finish_non_exhaustive()
    }
}

impl WebhookSigner {
    /// The seed is the secret repeated until it fills 32 bytes. Returns `None`
    /// for an empty secret.
    pub fn from_secret(secret: &str) -> Option<Self> {
        let secret = secret.trim().as_bytes();
        if secret.is_empty() {
            return None;
        }
        let mut seed = [0_u8; 32];
        for (slot, byte) in seed.iter_mut().zip(secret.iter().cycle()) {
            *slot = *byte;
        }
        Some(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    pub fn verify_hex(&self, message: &[u8], signature_hex: &str) -> bool {
        let Ok(bytes) = hex::decode(signature_hex.trim()) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };
        self.signing_key
            .verifying_key()
            .verify(message, &signature)
            .is_ok()
    }

    /// Challenge answer: signature over `event_ts` followed by `plain_token`.
    pub fn answer_validation(&self, event_ts: &str, plain_token: &str) -> String {
        self.sign_hex(format!("{event_ts}{plain_token}").as_bytes())
    }
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    op: u8,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Deserialize)]
struct ValidationChallenge {
    plain_token: String,
    event_ts: String,
}

fn string_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

struct EventShape {
    kind: ConversationKind,
    /// Author id fields under `d.author`, most specific first.
    author_fields: &'static [&'static str],
    group_field: Option<&'static str>,
}

fn event_shape(event_type: &str) -> Option<EventShape> {
    let shape = match event_type {
        GROUP_AT_MESSAGE_CREATE => EventShape {
            kind: ConversationKind::Group,
            author_fields: &["member_openid", "id"],
            group_field: Some("group_openid"),
        },
        C2C_MESSAGE_CREATE => EventShape {
            kind: ConversationKind::GroupPrivate,
            author_fields: &["user_openid", "id"],
            group_field: None,
        },
        AT_MESSAGE_CREATE => EventShape {
            kind: ConversationKind::Guild,
            author_fields: &["id"],
            group_field: Some("channel_id"),
        },
        DIRECT_MESSAGE_CREATE => EventShape {
            kind: ConversationKind::GuildPrivate,
            author_fields: &["id"],
            group_field: None,
        },
        _ => return None,
    };
    Some(shape)
}

/// Maps one dispatch to an inbound message. `Ok(None)` is an event type the
/// gateway does not handle.
pub fn parse_message_event(
    event_type: &str,
    data: &Value,
) -> Result<Option<InboundMessageEvent>, String> {
    let Some(shape) = event_shape(event_type) else {
        return Ok(None);
    };
    let message_id = string_field(data, "id").ok_or("event is missing d.id")?;
    let author = data.get("author").unwrap_or(&Value::Null);
    let user_native_id = shape
        .author_fields
        .iter()
        .find_map(|field| string_field(author, field))
        .ok_or("event is missing the author id")?;
    let group_native_id = match shape.group_field {
        Some(field) => Some(
            string_field(data, field)
                .ok_or_else(|| format!("event is missing d.{field}"))?
                .to_string(),
        ),
        None => None,
    };
    let content = data.get("content").and_then(Value::as_str).unwrap_or("");
    Ok(Some(InboundMessageEvent {
        kind: shape.kind,
        message_id: message_id.to_string(),
        user_native_id: user_native_id.to_string(),
        group_native_id,
        text: strip_leading_mentions(content).to_string(),
    }))
}

pub struct WebhookState {
    forwarder: Arc<EventForwarder>,
    signer: Option<WebhookSigner>,
    status: Arc<dyn ConnectionStatus>,
}

impl WebhookState {
    pub fn new(
        forwarder: Arc<EventForwarder>,
        signer: Option<WebhookSigner>,
        status: Arc<dyn ConnectionStatus>,
    ) -> Self {
        Self {
            forwarder,
            signer,
            status,
        }
    }
}

pub fn build_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/healthz", get(handle_healthz))
        .with_state(state)
}

async fn handle_healthz(State(state): State<Arc<WebhookState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({"status":"ok","connection":state.status.connection_state().as_str()})),
    )
}

fn error_response(status: StatusCode, code: &str, message: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"error":{"code":code,"message":message}})),
    )
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
}

async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Some(signer) = state.signer.as_ref() {
        let timestamp = header_value(&headers, SIGNATURE_TIMESTAMP_HEADER);
        let signature = header_value(&headers, SIGNATURE_HEADER);
        let signed = format!("{timestamp}{body}");
        if signature.is_empty() || !signer.verify_hex(signed.as_bytes(), signature) {
            warn!("rejected webhook request with invalid signature");
            return error_response(
                StatusCode::UNAUTHORIZED,
                "auth_failed",
                "invalid webhook signature",
            );
        }
    }

    let payload = match serde_json::from_str::<WebhookPayload>(&body) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%error, "malformed webhook payload");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_payload",
                "webhook payload is not a valid event",
            );
        }
    };

    match payload.op {
        OP_CALLBACK_VALIDATION => {
            let Some(signer) = state.signer.as_ref() else {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "validation_unavailable",
                    "app_secret is not configured",
                );
            };
            let challenge = match serde_json::from_value::<ValidationChallenge>(payload.d) {
                Ok(challenge) => challenge,
                Err(_) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "invalid_payload",
                        "validation challenge requires plain_token and event_ts",
                    )
                }
            };
            let signature = signer.answer_validation(&challenge.event_ts, &challenge.plain_token);
            (
                StatusCode::OK,
                Json(json!({"plain_token":challenge.plain_token,"signature":signature})),
            )
        }
        OP_DISPATCH => {
            let event_type = payload.t.unwrap_or_default();
            match parse_message_event(&event_type, &payload.d) {
                Ok(Some(event)) => {
                    let outcome = state.forwarder.forward(&event).await;
                    debug!(event_type = %event_type, outcome = ?outcome, "webhook dispatch handled");
                }
                Ok(None) => debug!(event_type = %event_type, "ignoring unsupported webhook event"),
                Err(reason) => {
                    warn!(event_type = %event_type, reason = %reason, "dropping malformed webhook event");
                }
            }
            (StatusCode::OK, Json(json!({"op":OP_HTTP_CALLBACK_ACK})))
        }
        other => {
            debug!(op = other, "ignoring webhook op");
            (StatusCode::OK, Json(json!({"op":OP_HTTP_CALLBACK_ACK})))
        }
    }
}
