//! Turns recorded upstream messages into OneBot message events for the
//! downstream bot.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use onegate_core::{current_unix_timestamp, ConversationKind, CorrelationMode, MessageSink};
use onegate_correlation::{InboundEventRecorder, InboundMessageEvent, RecordedInbound};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::{
    gateway_config::GatewayConfig,
    message_content::is_whitelisted,
    upstream_api::{OutboundMessage, UpstreamApi},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Forwarded,
    /// Not whitelisted; answered upstream and kept from the bot.
    AutoReplied,
    /// Id mapping failed; nothing was recorded.
    Dropped,
    /// Recorded, but no downstream session took the event.
    Undelivered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderSettings {
    pub self_id: u64,
    pub mode: CorrelationMode,
    pub master_ids: Vec<String>,
    pub command_whitelist: Vec<String>,
    /// Sent instead of forwarding when a message misses the whitelist.
    pub auto_reply_message: Option<String>,
}

impl ForwarderSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            self_id: config.app_id,
            mode: config.correlation_mode(),
            master_ids: config.master_ids.clone(),
            command_whitelist: config.command_whitelist.clone(),
            auto_reply_message: config
                .auto_reply
                .then(|| config.auto_reply_message.trim().to_string())
                .filter(|message| !message.is_empty()),
        }
    }

    /// Masters may be listed by compact id or by platform openid. The openid
    /// form survives a change of id allocation.
    fn role_for(&self, user_id: i64, user_native_id: &str) -> &'static str {
        let user_id = user_id.to_string();
        let user_native_id = user_native_id.trim();
        if self.master_ids.iter().map(|master| master.trim()).any(|master| {
            !master.is_empty() && (master == user_id || master == user_native_id)
        }) {
            "owner"
        } else {
            "member"
        }
    }
}

/// OneBot `message` event for a recorded inbound message.
pub fn build_message_event(
    settings: &ForwarderSettings,
    event: &InboundMessageEvent,
    recorded: &RecordedInbound,
    time: u64,
) -> Value {
    let (message_type, sub_type) = if event.kind.is_group_like() {
        ("group", "normal")
    } else {
        ("private", "friend")
    };
    let mut payload = Map::new();
    payload.insert("post_type".to_string(), json!("message"));
    payload.insert("message_type".to_string(), json!(message_type));
    payload.insert("sub_type".to_string(), json!(sub_type));
    payload.insert(
        "message_id".to_string(),
        json!(recorded.message_alias.unwrap_or_default()),
    );
    payload.insert("user_id".to_string(), json!(recorded.user_id));
    if let Some(group_id) = recorded.group_id {
        payload.insert("group_id".to_string(), json!(group_id));
    }
    payload.insert("raw_message".to_string(), json!(event.text));
    payload.insert("message".to_string(), json!(event.text));
    payload.insert("font".to_string(), json!(0));
    payload.insert("self_id".to_string(), json!(settings.self_id));
    payload.insert("time".to_string(), json!(time));
    payload.insert(
        "sender".to_string(),
        json!({
            "user_id": recorded.user_id,
            "nickname": "",
            "role": settings.role_for(recorded.user_id, &event.user_native_id),
        }),
    );
    payload.insert(
        settings.mode.field_name().to_string(),
        json!(recorded.token),
    );
    Value::Object(payload)
}

pub struct EventForwarder {
    recorder: InboundEventRecorder,
    api: Arc<dyn UpstreamApi>,
    downstream: Arc<dyn MessageSink>,
    settings: ForwarderSettings,
    msg_seq: AtomicU32,
}

impl EventForwarder {
    pub fn new(
        recorder: InboundEventRecorder,
        api: Arc<dyn UpstreamApi>,
        downstream: Arc<dyn MessageSink>,
        settings: ForwarderSettings,
    ) -> Self {
        Self {
            recorder,
            api,
            downstream,
            settings,
            msg_seq: AtomicU32::new(1),
        }
    }

    pub fn settings(&self) -> &ForwarderSettings {
        &self.settings
    }

    pub async fn forward(&self, event: &InboundMessageEvent) -> ForwardOutcome {
        // Decided before recording: a message the gateway answers itself must
        // not hold a place in the group's pending reply queue.
        let auto_reply = self
            .settings
            .auto_reply_message
            .as_deref()
            .filter(|_| !is_whitelisted(&event.text, &self.settings.command_whitelist));
        let recorded = match auto_reply {
            Some(_) => self.recorder.record_without_pending(event),
            None => self.recorder.record(event),
        };
        let recorded = match recorded {
            Ok(recorded) => recorded,
            Err(error) => {
                warn!(kind = %event.kind, %error, "dropping inbound event");
                return ForwardOutcome::Dropped;
            }
        };

        if let Some(reply) = auto_reply {
            self.auto_reply(event, reply).await;
            return ForwardOutcome::AutoReplied;
        }

        let payload =
            build_message_event(&self.settings, event, &recorded, current_unix_timestamp());
        match self.downstream.send_message(payload).await {
            Ok(()) => {
                debug!(
                    kind = %event.kind,
                    user_id = recorded.user_id,
                    group_id = ?recorded.group_id,
                    "forwarded inbound message downstream"
                );
                ForwardOutcome::Forwarded
            }
            Err(error) => {
                warn!(
                    kind = %event.kind,
                    error = %format!("{error:#}"),
                    "inbound message not delivered downstream"
                );
                ForwardOutcome::Undelivered
            }
        }
    }

    async fn auto_reply(&self, event: &InboundMessageEvent, reply: &str) {
        let message = OutboundMessage::text(
            reply,
            Some(event.message_id.clone()),
            self.msg_seq.fetch_add(1, Ordering::Relaxed),
        );
        let group = event.group_native_id.as_deref();
        let result = match (event.kind, group) {
            (ConversationKind::Group, Some(group_openid)) => {
                self.api.post_group_message(group_openid, &message).await
            }
            (ConversationKind::Guild, Some(channel_id)) => {
                self.api.post_channel_message(channel_id, &message).await
            }
            (ConversationKind::GroupPrivate, _) => {
                self.api
                    .post_c2c_message(&event.user_native_id, &message)
                    .await
            }
            (kind, _) => {
                debug!(kind = %kind, "no auto-reply route for conversation");
                return;
            }
        };
        match result {
            Ok(_) => info!(kind = %event.kind, "auto-replied to non-whitelisted message"),
            Err(error) => warn!(kind = %event.kind, %error, "auto-reply failed"),
        }
    }
}
