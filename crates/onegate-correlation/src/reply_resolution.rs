//! Recovers "who to reply to, inside which passive-reply window" for an
//! outbound downstream action that may carry little or no context.
//!
//! Signals are tried from most to least precise and the first hit wins for
//! each unknown:
//!
//! 1. correlation token -> message id -> user id
//! 2. explicit `user_id` from the request
//! 3. oldest pending group message (skipped in token mode)
//! 4. latest speaker in the group (racy last resort)
//! 5. user's numeric key -> message id
//!
//! A miss everywhere still yields a target; the upstream API decides whether
//! a reply without a window is accepted.

use onegate_core::{ConversationKind, CorrelationMode};
use tracing::{debug, warn};

use crate::{correlation_key::numeric_correlation_key, correlation_store::CorrelationStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Token,
    ExplicitUser,
    PendingQueue,
    GroupLatestUser,
    UserKey,
    /// The token named a message but no user was bound to it.
    TokenMessageOnly,
    Unresolved,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyQuery<'a> {
    /// Canonical correlation key echoed back by the bot, if any.
    pub correlation_key: Option<&'a str>,
    /// `user_id` parameter as sent by the bot; `""` and `"0"` mean absent.
    pub explicit_user_id: Option<&'a str>,
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub user_id: Option<i64>,
    pub message_id: Option<String>,
    pub user_source: ReplySource,
    pub message_source: ReplySource,
}

impl ReplyTarget {
    pub fn has_reply_window(&self) -> bool {
        self.message_id.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct ReplyResolver {
    store: CorrelationStore,
    app_id: String,
    mode: CorrelationMode,
}

impl ReplyResolver {
    pub fn new(store: CorrelationStore, app_id: impl Into<String>, mode: CorrelationMode) -> Self {
        Self {
            store,
            app_id: app_id.into(),
            mode,
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    pub fn resolve(&self, query: &ReplyQuery<'_>) -> ReplyTarget {
        let mut user: Option<(i64, ReplySource)> = None;
        let mut message: Option<(String, ReplySource)> = None;

        let token_message = query
            .correlation_key
            .filter(|key| !key.is_empty())
            .and_then(|key| self.store.get_message(key));
        if let Some(message_id) = token_message.as_deref() {
            if let Some(user_id) = self.store.get_user_for_message(message_id) {
                user = Some((user_id, ReplySource::Token));
                message = Some((message_id.to_string(), ReplySource::Token));
            }
        }

        if user.is_none() {
            if let Some(user_id) = query.explicit_user_id.and_then(parse_explicit_user_id) {
                user = Some((user_id, ReplySource::ExplicitUser));
            }
        }

        if user.is_none() {
            if let Some(group_id) = query.group_id {
                if self.mode.is_token_based() {
                    debug!(group_id, "token correlation mode; pending queue skipped");
                } else if let Some(pending) = self.store.pop_pending(group_id) {
                    user = Some((pending.user_id, ReplySource::PendingQueue));
                    message = Some((pending.message_id, ReplySource::PendingQueue));
                } else if let Some(user_id) = self.store.get_group_latest_user(group_id) {
                    user = Some((user_id, ReplySource::GroupLatestUser));
                }
            }
        }

        if message.is_none() {
            if let Some((user_id, _)) = user {
                let user_key = numeric_correlation_key(&self.app_id, user_id);
                message = self
                    .store
                    .get_message(&user_key)
                    .map(|message_id| (message_id, ReplySource::UserKey));
            }
        }

        if message.is_none() {
            message = token_message.map(|message_id| (message_id, ReplySource::TokenMessageOnly));
        }

        let target = ReplyTarget {
            user_id: user.map(|(user_id, _)| user_id),
            user_source: user.map_or(ReplySource::Unresolved, |(_, source)| source),
            message_source: message
                .as_ref()
                .map_or(ReplySource::Unresolved, |(_, source)| *source),
            message_id: message.map(|(message_id, _)| message_id),
        };
        if target.has_reply_window() {
            debug!(
                user_id = ?target.user_id,
                user_source = ?target.user_source,
                message_source = ?target.message_source,
                "resolved reply target"
            );
        } else {
            warn!(
                user_id = ?target.user_id,
                group_id = ?query.group_id,
                "no passive-reply message id found; upstream may reject the reply"
            );
        }
        target
    }

    /// Looks up the recorded conversation kind, trying the token first and
    /// then each numeric id (as sent by the bot) in the order given.
    pub fn conversation_kind(
        &self,
        correlation_key: Option<&str>,
        numeric_ids: &[Option<&str>],
    ) -> Option<ConversationKind> {
        if let Some(kind) = correlation_key
            .filter(|key| !key.is_empty())
            .and_then(|key| self.store.get_type(key))
        {
            return Some(kind);
        }
        numeric_ids
            .iter()
            .flatten()
            .filter(|id| !id.is_empty())
            .find_map(|id| self.store.get_type(&format!("{}_{}", self.app_id, id)))
    }
}

fn parse_explicit_user_id(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0" {
        return None;
    }
    raw.parse::<i64>().ok().filter(|user_id| *user_id > 0)
}
