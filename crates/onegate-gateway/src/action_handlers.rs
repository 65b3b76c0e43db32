//! Downstream actions that post into upstream conversations.
//!
//! Every handler routes by the recorded conversation kind, recovers the
//! passive-reply window through [`ReplyResolver`], posts upstream and writes
//! one report frame back to the session the request came from.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use onegate_connection::{ConnectionManager, ConnectionState};
use onegate_core::{ConversationKind, CorrelationMode, IdStore, MessageSink};
use onegate_correlation::{
    numeric_correlation_key, CorrelationStore, ReplyQuery, ReplyResolver,
};
use onegate_dispatch::{ActionDispatcher, ActionHandler, ActionMessage};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    action_report::ActionReport,
    message_content::extract_text,
    upstream_api::{OutboundMessage, UpstreamApi, UpstreamApiError},
};

pub const SEND_GROUP_MSG: &str = "send_group_msg";
pub const SEND_MSG: &str = "send_msg";
pub const SEND_PRIVATE_MSG: &str = "send_private_msg";
pub const GET_STATUS: &str = "get_status";

const SEND_FAILED_PREFIX: &str = "message send failed: ";

/// Read-only view of the downstream connection for status actions.
pub trait ConnectionStatus: Send + Sync {
    fn connection_state(&self) -> ConnectionState;
}

impl ConnectionStatus for ConnectionManager {
    fn connection_state(&self) -> ConnectionState {
        self.state()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Group { group_openid: String },
    C2c { user_openid: String },
    Channel { channel_id: String },
}

impl Route {
    fn describe(&self) -> (&'static str, &str) {
        match self {
            Self::Group { group_openid } => ("group", group_openid),
            Self::C2c { user_openid } => ("c2c", user_openid),
            Self::Channel { channel_id } => ("channel", channel_id),
        }
    }
}

/// Shared collaborators for all gateway action handlers.
pub struct GatewayContext {
    store: CorrelationStore,
    resolver: ReplyResolver,
    ids: Arc<dyn IdStore>,
    api: Arc<dyn UpstreamApi>,
    status: Arc<dyn ConnectionStatus>,
    app_id: String,
    mode: CorrelationMode,
    msg_seq: AtomicU32,
}

impl GatewayContext {
    pub fn new(
        store: CorrelationStore,
        ids: Arc<dyn IdStore>,
        api: Arc<dyn UpstreamApi>,
        status: Arc<dyn ConnectionStatus>,
        app_id: impl Into<String>,
        mode: CorrelationMode,
    ) -> Self {
        let app_id = app_id.into();
        Self {
            resolver: ReplyResolver::new(store.clone(), app_id.clone(), mode),
            store,
            ids,
            api,
            status,
            app_id,
            mode,
            msg_seq: AtomicU32::new(1),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    pub fn resolver(&self) -> &ReplyResolver {
        &self.resolver
    }

    fn next_msg_seq(&self) -> u32 {
        self.msg_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn parse_id(field: &str, raw: Option<&str>) -> Result<i64, ActionReport> {
        let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Err(ActionReport::failed(format!("missing {field}")));
        };
        raw.parse::<i64>()
            .map_err(|_| ActionReport::failed(format!("{field} '{raw}' is not a numeric id")))
    }

    fn native_id(&self, field: &str, id: i64) -> Result<String, ActionReport> {
        self.ids.resolve(id).map_err(|error| {
            warn!(field, id, %error, "failed to resolve native id");
            ActionReport::failed(format!("unknown {field} {id}"))
        })
    }

    async fn post(
        &self,
        route: &Route,
        message: &OutboundMessage,
    ) -> Result<Option<String>, UpstreamApiError> {
        let posted = match route {
            Route::Group { group_openid } => self.api.post_group_message(group_openid, message),
            Route::C2c { user_openid } => self.api.post_c2c_message(user_openid, message),
            Route::Channel { channel_id } => self.api.post_channel_message(channel_id, message),
        }
        .await?;
        Ok(posted.id)
    }

    /// Posts `text` and converts the outcome into a report. A real failure is
    /// also announced inside the conversation.
    async fn deliver(&self, route: Route, text: &str, reply_to: Option<String>) -> ActionReport {
        let (route_kind, target) = route.describe();
        let outbound = OutboundMessage::text(text, reply_to.clone(), self.next_msg_seq());
        match self.post(&route, &outbound).await {
            Ok(posted_id) => {
                let message_id = posted_id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .and_then(|id| self.ids.alias(id).ok());
                info!(
                    route = route_kind,
                    target,
                    passive = reply_to.is_some(),
                    message_id = ?message_id,
                    "posted upstream message"
                );
                ActionReport::sent(message_id)
            }
            Err(error) => {
                warn!(route = route_kind, target, %error, "upstream send failed");
                if error.is_real_failure() {
                    let notice = OutboundMessage::text(
                        format!("{SEND_FAILED_PREFIX}{}", error.sanitized_message()),
                        reply_to,
                        self.next_msg_seq(),
                    );
                    if let Err(notice_error) = self.post(&route, &notice).await {
                        warn!(
                            route = route_kind,
                            target,
                            error = %notice_error,
                            "failed to post send-failure notice"
                        );
                    }
                }
                ActionReport::from_upstream_error(&error)
            }
        }
    }

    async fn send_to_group(&self, action: &ActionMessage, text: &str) -> ActionReport {
        let group_id = match Self::parse_id("group_id", action.params.group_id.as_deref()) {
            Ok(group_id) => group_id,
            Err(report) => return report,
        };
        let group_openid = match self.native_id("group_id", group_id) {
            Ok(native) => native,
            Err(report) => return report,
        };
        let target = self.resolver.resolve(&ReplyQuery {
            correlation_key: action.correlation_key.as_deref(),
            explicit_user_id: action.params.user_id.as_deref(),
            group_id: Some(group_id),
        });
        debug!(group_id, user_id = ?target.user_id, "group reply target");
        self.deliver(Route::Group { group_openid }, text, target.message_id)
            .await
    }

    async fn send_to_user(
        &self,
        action: &ActionMessage,
        user_id: Option<&str>,
        text: &str,
    ) -> ActionReport {
        let target = self.resolver.resolve(&ReplyQuery {
            correlation_key: action.correlation_key.as_deref(),
            explicit_user_id: user_id,
            group_id: None,
        });
        let Some(resolved_user) = target.user_id else {
            return ActionReport::failed("no user to reply to");
        };
        let user_openid = match self.native_id("user_id", resolved_user) {
            Ok(native) => native,
            Err(report) => return report,
        };
        self.deliver(Route::C2c { user_openid }, text, target.message_id)
            .await
    }

    async fn send_to_channel(&self, action: &ActionMessage, text: &str) -> ActionReport {
        let raw_channel = action
            .params
            .channel_id
            .as_deref()
            .or(action.params.group_id.as_deref());
        let channel = match Self::parse_id("channel_id", raw_channel) {
            Ok(channel) => channel,
            Err(report) => return report,
        };
        let channel_id = match self.native_id("channel_id", channel) {
            Ok(native) => native,
            Err(report) => return report,
        };
        let message_id = action
            .correlation_key
            .as_deref()
            .and_then(|key| self.store.get_message(key))
            .or_else(|| {
                self.store
                    .get_message(&numeric_correlation_key(&self.app_id, channel))
            });
        self.deliver(Route::Channel { channel_id }, text, message_id)
            .await
    }

    async fn send_by_kind(
        &self,
        action: &ActionMessage,
        kind: ConversationKind,
        private_user: Option<&str>,
    ) -> ActionReport {
        // Checked before resolution so an empty message never consumes a
        // pending reply window.
        let text = extract_text(action.params.message.as_ref());
        if text.trim().is_empty() {
            return ActionReport::failed("message has no text content");
        }
        match kind {
            ConversationKind::Group => self.send_to_group(action, &text).await,
            ConversationKind::GroupPrivate => {
                self.send_to_user(action, private_user, &text).await
            }
            ConversationKind::Guild => self.send_to_channel(action, &text).await,
            ConversationKind::GuildPrivate => {
                ActionReport::failed("guild direct messages are not supported")
            }
        }
    }

    pub async fn send_group_msg(&self, action: &ActionMessage) -> ActionReport {
        let params = &action.params;
        let kind = self
            .resolver
            .conversation_kind(
                action.correlation_key.as_deref(),
                &[params.user_id.as_deref(), params.group_id.as_deref()],
            )
            .unwrap_or(ConversationKind::Group);
        // Private chats presented as groups carry the user in group_id.
        self.send_by_kind(action, kind, params.group_id.as_deref())
            .await
    }

    pub async fn send_msg(&self, action: &ActionMessage) -> ActionReport {
        let params = &action.params;
        let recorded = self.resolver.conversation_kind(
            action.correlation_key.as_deref(),
            &[params.group_id.as_deref(), params.user_id.as_deref()],
        );
        let kind = match (recorded, params.message_type.as_deref()) {
            (Some(kind), _) => kind,
            (None, Some("group")) => ConversationKind::Group,
            (None, Some("private")) => ConversationKind::GroupPrivate,
            (None, _) if params.group_id.is_some() => ConversationKind::Group,
            (None, _) if params.user_id.is_some() => ConversationKind::GroupPrivate,
            (None, _) => return ActionReport::failed("unable to determine conversation"),
        };
        let private_user = params.user_id.as_deref().or(params.group_id.as_deref());
        self.send_by_kind(action, kind, private_user).await
    }

    pub async fn send_private_msg(&self, action: &ActionMessage) -> ActionReport {
        let params = &action.params;
        let recorded = self
            .resolver
            .conversation_kind(action.correlation_key.as_deref(), &[params.user_id.as_deref()]);
        let kind = match recorded {
            Some(ConversationKind::GuildPrivate) => ConversationKind::GuildPrivate,
            _ => ConversationKind::GroupPrivate,
        };
        self.send_by_kind(action, kind, params.user_id.as_deref())
            .await
    }

    pub fn get_status(&self) -> ActionReport {
        let online = self.status.connection_state() == ConnectionState::Connected;
        ActionReport::ok(json!({ "online": online, "good": online }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatewayAction {
    SendGroupMsg,
    SendMsg,
    SendPrivateMsg,
    GetStatus,
}

struct ContextHandler {
    context: Arc<GatewayContext>,
    action: GatewayAction,
}

#[async_trait]
impl ActionHandler for ContextHandler {
    async fn handle(&self, reply: Arc<dyn MessageSink>, message: ActionMessage) -> Result<()> {
        let report = match self.action {
            GatewayAction::SendGroupMsg => self.context.send_group_msg(&message).await,
            GatewayAction::SendMsg => self.context.send_msg(&message).await,
            GatewayAction::SendPrivateMsg => self.context.send_private_msg(&message).await,
            GatewayAction::GetStatus => self.context.get_status(),
        };
        reply
            .send_message(report.to_frame(self.context.mode(), &message))
            .await
            .with_context(|| format!("failed to report result of {}", message.action))
    }
}

pub fn register_default_handlers(dispatcher: &mut ActionDispatcher, context: Arc<GatewayContext>) {
    for (name, action) in [
        (SEND_GROUP_MSG, GatewayAction::SendGroupMsg),
        (SEND_MSG, GatewayAction::SendMsg),
        (SEND_PRIVATE_MSG, GatewayAction::SendPrivateMsg),
        (GET_STATUS, GatewayAction::GetStatus),
    ] {
        dispatcher.register(
            name,
            Arc::new(ContextHandler {
                context: Arc::clone(&context),
                action,
            }),
        );
    }
}

#[cfg(test)]
mod tests;
