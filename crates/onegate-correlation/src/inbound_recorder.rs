//! Populates the correlation store for every inbound upstream message so that
//! later downstream replies can find their passive-reply window.

use std::sync::Arc;

use onegate_core::{
    current_unix_timestamp_ms, new_request_id, ConversationKind, CorrelationMode, IdStore,
    IdStoreError,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    correlation_key::{bare_token_suffix, numeric_correlation_key, token_correlation_key},
    correlation_store::CorrelationStore,
};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("inbound event has an empty message id")]
    EmptyMessageId,
    #[error("failed to map user id '{native_id}': {source}")]
    UserId {
        native_id: String,
        #[source]
        source: IdStoreError,
    },
    #[error("failed to map group id '{native_id}': {source}")]
    GroupId {
        native_id: String,
        #[source]
        source: IdStoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Shape of the token handed to the downstream bot with each event.
pub enum TokenStyle {
    /// `<app_id>_<millis>-<uuid>`, unique per event.
    #[default]
    Opaque,
    /// `<app_id>_<user compact id>`, overwritten by the user's next event.
    Numeric,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecorderConfig {
    pub app_id: String,
    pub mode: CorrelationMode,
    pub token_style: TokenStyle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Platform-native view of one inbound message, before id mapping.
pub struct InboundMessageEvent {
    pub kind: ConversationKind,
    pub message_id: String,
    pub user_native_id: String,
    /// Group openid, or channel id for guild messages. `None` for direct chats.
    pub group_native_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedInbound {
    pub token: String,
    pub user_id: i64,
    pub group_id: Option<i64>,
    /// Compact alias of the upstream message id, when the id store produced one.
    pub message_alias: Option<i64>,
    pub enqueued: bool,
}

#[derive(Clone)]
pub struct InboundEventRecorder {
    store: CorrelationStore,
    ids: Arc<dyn IdStore>,
    config: InboundRecorderConfig,
}

impl InboundEventRecorder {
    pub fn new(
        store: CorrelationStore,
        ids: Arc<dyn IdStore>,
        config: InboundRecorderConfig,
    ) -> Self {
        Self { store, ids, config }
    }

    pub fn config(&self) -> &InboundRecorderConfig {
        &self.config
    }

    /// Records every binding a later reply may need.
    ///
    /// An event whose user (or group) identity can not be mapped is dropped
    /// with an error and nothing is written. A failure to alias the message id
    /// only costs the alias.
    pub fn record(&self, event: &InboundMessageEvent) -> Result<RecordedInbound, RecordError> {
        self.record_inner(event, true)
    }

    /// Same bindings as [`Self::record`] but never joins the group's pending
    /// queue. Used for messages the gateway answers itself, which no
    /// downstream reply will ever consume.
    pub fn record_without_pending(
        &self,
        event: &InboundMessageEvent,
    ) -> Result<RecordedInbound, RecordError> {
        self.record_inner(event, false)
    }

    fn record_inner(
        &self,
        event: &InboundMessageEvent,
        enqueue: bool,
    ) -> Result<RecordedInbound, RecordError> {
        let message_id = event.message_id.trim();
        if message_id.is_empty() {
            return Err(RecordError::EmptyMessageId);
        }
        let user_id =
            self.ids
                .store(&event.user_native_id)
                .map_err(|source| RecordError::UserId {
                    native_id: event.user_native_id.clone(),
                    source,
                })?;
        let group_id = match event.group_native_id.as_deref() {
            Some(native_id) => {
                Some(
                    self.ids
                        .store(native_id)
                        .map_err(|source| RecordError::GroupId {
                            native_id: native_id.to_string(),
                            source,
                        })?,
                )
            }
            None => None,
        };
        let message_alias = match self.ids.alias(message_id) {
            Ok(alias) => Some(alias),
            Err(error) => {
                warn!(message_id, %error, "failed to alias inbound message id");
                None
            }
        };

        let app_id = self.config.app_id.as_str();
        let kind = event.kind;
        let token = match self.config.token_style {
            TokenStyle::Opaque => {
                token_correlation_key(app_id, &new_request_id(current_unix_timestamp_ms()))
            }
            TokenStyle::Numeric => numeric_correlation_key(app_id, user_id),
        };

        self.store.put_message(&token, message_id);
        self.store.put_type(&token, kind);
        if self.config.token_style == TokenStyle::Opaque {
            if let Some(bare) = bare_token_suffix(&token) {
                self.store.put_message(bare, message_id);
                self.store.put_type(bare, kind);
            }
        }

        let user_key = numeric_correlation_key(app_id, user_id);
        self.store.put_message(&user_key, message_id);
        self.store.put_type(&user_key, kind);

        self.store.put_user_for_message(message_id, user_id);
        if let Some(alias) = message_alias {
            self.store
                .put_user_for_message(&alias.to_string(), user_id);
        }

        let mut enqueued = false;
        if let Some(group_id) = group_id {
            self.store.set_group_latest_user(group_id, user_id);
            if enqueue && !event.text.trim().is_empty() && !self.config.mode.is_token_based() {
                self.store.push_pending(group_id, user_id, message_id);
                enqueued = true;
            }
            let group_key = numeric_correlation_key(app_id, group_id);
            self.store.put_type(&group_key, kind);
            if kind == ConversationKind::Guild {
                // Guild channels reply by channel, so keep a channel-keyed window too.
                self.store.put_message(&group_key, message_id);
            }
        }

        debug!(
            kind = %kind,
            user_id,
            group_id = ?group_id,
            message_alias = ?message_alias,
            enqueued,
            "recorded inbound correlation"
        );
        Ok(RecordedInbound {
            token,
            user_id,
            group_id,
            message_alias,
            enqueued,
        })
    }
}
