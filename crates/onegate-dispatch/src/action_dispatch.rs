use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use onegate_core::MessageSink;
use tracing::{debug, warn};

use crate::action_decode::{best_effort_action_name, decode_action_message, ActionMessage};

#[async_trait]
/// A downstream action implementation. `reply` is the session the request
/// arrived on; reports are written to it.
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, reply: Arc<dyn MessageSink>, message: ActionMessage) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    HandlerFailed,
    UnsupportedAction,
    DecodeFailed,
}

#[derive(Default, Clone)]
/// Action name to handler lookup table, filled at startup.
pub struct ActionDispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `action`, replacing any earlier registration.
    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    pub fn is_registered(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn registered_actions(&self) -> Vec<&str> {
        let mut actions = self.handlers.keys().map(String::as_str).collect::<Vec<_>>();
        actions.sort_unstable();
        actions
    }

    pub async fn dispatch(
        &self,
        reply: Arc<dyn MessageSink>,
        message: ActionMessage,
    ) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(message.action.as_str()) else {
            warn!(action = %message.action, "unsupported action; dropping");
            return DispatchOutcome::UnsupportedAction;
        };
        let action = message.action.clone();
        debug!(action = %action, correlation_key = ?message.correlation_key, "dispatching action");
        match handler.handle(reply, message).await {
            Ok(()) => DispatchOutcome::Handled,
            Err(error) => {
                warn!(action = %action, error = %format!("{error:#}"), "action handler failed");
                DispatchOutcome::HandlerFailed
            }
        }
    }

    /// Decodes one raw frame and dispatches it. Undecodable frames are logged
    /// and dropped.
    pub async fn dispatch_frame(&self, reply: Arc<dyn MessageSink>, raw: &str) -> DispatchOutcome {
        match decode_action_message(raw) {
            Ok(message) => self.dispatch(reply, message).await,
            Err(error) => {
                warn!(
                    action = ?best_effort_action_name(raw),
                    %error,
                    "failed to decode action frame; dropping"
                );
                DispatchOutcome::DecodeFailed
            }
        }
    }
}
