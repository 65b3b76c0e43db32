use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use async_trait::async_trait;
use onegate_connection::ConnectionState;
use onegate_core::{ConversationKind, CorrelationMode, MemoryIdStore, MessageSink};
use onegate_correlation::{
    CorrelationStore, InboundEventRecorder, InboundMessageEvent, InboundRecorderConfig,
    RecordedInbound, TokenStyle,
};
use onegate_dispatch::{ActionDispatcher, DispatchOutcome};
use serde_json::{json, Value};

use super::{register_default_handlers, ConnectionStatus, GatewayContext};
use crate::upstream_api::{OutboundMessage, PostedMessage, UpstreamApi, UpstreamApiError};

const APP_ID: &str = "102005";

#[derive(Debug, Clone, PartialEq)]
struct PostedCall {
    route: &'static str,
    target: String,
    message: OutboundMessage,
}

#[derive(Default)]
struct RecordingApi {
    calls: Mutex<Vec<PostedCall>>,
    failures: Mutex<VecDeque<UpstreamApiError>>,
}

impl RecordingApi {
    fn fail_next(&self, error: UpstreamApiError) {
        self.failures.lock().expect("failures lock").push_back(error);
    }

    fn calls(&self) -> Vec<PostedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(
        &self,
        route: &'static str,
        target: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError> {
        let mut calls = self.calls.lock().expect("calls lock");
        calls.push(PostedCall {
            route,
            target: target.to_string(),
            message: message.clone(),
        });
        let sequence = calls.len();
        drop(calls);
        match self.failures.lock().expect("failures lock").pop_front() {
            Some(error) => Err(error),
            None => Ok(PostedMessage {
                id: Some(format!("posted-{sequence}")),
            }),
        }
    }
}

#[async_trait]
impl UpstreamApi for RecordingApi {
    async fn post_group_message(
        &self,
        group_openid: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError> {
        self.record("group", group_openid, message)
    }

    async fn post_c2c_message(
        &self,
        user_openid: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError> {
        self.record("c2c", user_openid, message)
    }

    async fn post_channel_message(
        &self,
        channel_id: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError> {
        self.record("channel", channel_id, message)
    }
}

struct FixedStatus(ConnectionState);

impl ConnectionStatus for FixedStatus {
    fn connection_state(&self) -> ConnectionState {
        self.0
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Value>>,
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send_message(&self, payload: Value) -> Result<()> {
        self.sent.lock().expect("sink lock").push(payload);
        Ok(())
    }
}

struct Harness {
    store: CorrelationStore,
    ids: Arc<MemoryIdStore>,
    recorder: InboundEventRecorder,
    api: Arc<RecordingApi>,
    dispatcher: ActionDispatcher,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new(mode: CorrelationMode) -> Self {
        let store = CorrelationStore::default();
        let ids = Arc::new(MemoryIdStore::sequential());
        let recorder = InboundEventRecorder::new(
            store.clone(),
            ids.clone(),
            InboundRecorderConfig {
                app_id: APP_ID.to_string(),
                mode,
                token_style: TokenStyle::Opaque,
            },
        );
        let api = Arc::new(RecordingApi::default());
        let context = Arc::new(GatewayContext::new(
            store.clone(),
            ids.clone(),
            api.clone(),
            Arc::new(FixedStatus(ConnectionState::Connected)),
            APP_ID,
            mode,
        ));
        let mut dispatcher = ActionDispatcher::new();
        register_default_handlers(&mut dispatcher, context);
        Self {
            store,
            ids,
            recorder,
            api,
            dispatcher,
            sink: Arc::new(RecordingSink::default()),
        }
    }

    fn record(
        &self,
        kind: ConversationKind,
        message_id: &str,
        user: &str,
        group: Option<&str>,
        text: &str,
    ) -> RecordedInbound {
        self.recorder
            .record(&InboundMessageEvent {
                kind,
                message_id: message_id.to_string(),
                user_native_id: user.to_string(),
                group_native_id: group.map(str::to_string),
                text: text.to_string(),
            })
            .expect("record inbound")
    }

    async fn dispatch(&self, frame: Value) -> Value {
        let outcome = self
            .dispatcher
            .dispatch_frame(self.sink.clone(), &frame.to_string())
            .await;
        assert_eq!(outcome, DispatchOutcome::Handled, "{frame}");
        self.sink
            .sent
            .lock()
            .expect("sink lock")
            .last()
            .cloned()
            .expect("report frame")
    }
}

fn group_of(recorded: &RecordedInbound) -> i64 {
    recorded.group_id.expect("group id")
}

#[tokio::test]
async fn functional_concurrent_group_senders_are_answered_in_arrival_order() {
    let harness = Harness::new(CorrelationMode::Echo);
    let first = harness.record(ConversationKind::Group, "mA", "UA", Some("G1"), "hi");
    harness.record(ConversationKind::Group, "mB", "UB", Some("G1"), "hey");
    let group_id = group_of(&first);

    for _ in 0..2 {
        let report = harness
            .dispatch(json!({
                "action": "send_group_msg",
                "params": {"group_id": group_id, "message": "pong"}
            }))
            .await;
        assert_eq!(report["retcode"], json!(0));
        assert!(report["data"]["message_id"].as_i64().unwrap_or_default() > 0);
    }

    let calls = harness.api.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|call| call.route == "group" && call.target == "G1"));
    assert_eq!(calls[0].message.msg_id.as_deref(), Some("mA"));
    assert_eq!(calls[1].message.msg_id.as_deref(), Some("mB"));
    assert_ne!(calls[0].message.msg_seq, calls[1].message.msg_seq);
    assert_eq!(harness.store.pending_len(group_id), 0);
}

#[tokio::test]
async fn functional_request_id_mode_uses_token_and_reports_it_back() {
    let harness = Harness::new(CorrelationMode::RequestId);
    let recorded = harness.record(ConversationKind::Group, "mA", "UA", Some("G1"), "hi");
    let group_id = group_of(&recorded);

    let report = harness
        .dispatch(json!({
            "action": "send_group_msg",
            "request_id": recorded.token,
            "params": {
                "group_id": group_id.to_string(),
                "message": [{"type": "text", "data": {"text": "pong"}}]
            }
        }))
        .await;
    assert_eq!(report["request_id"], json!(recorded.token));
    assert!(report.get("echo").is_none());

    let unanchored = harness
        .dispatch(json!({
            "action": "send_group_msg",
            "params": {"group_id": group_id, "message": "late"}
        }))
        .await;
    assert_eq!(unanchored["retcode"], json!(0));

    let calls = harness.api.calls();
    assert_eq!(calls[0].message.msg_id.as_deref(), Some("mA"));
    assert_eq!(calls[0].message.content, "pong");
    assert_eq!(calls[1].message.msg_id, None);
}

#[tokio::test]
async fn regression_real_failure_posts_sanitized_notice_and_reports_failed() {
    let harness = Harness::new(CorrelationMode::Echo);
    let recorded = harness.record(ConversationKind::Group, "mA", "UA", Some("G1"), "hi");
    harness.api.fail_next(UpstreamApiError::Status {
        status: 400,
        body: r#"{"code":850026,"message":"download failed","err_code":0,"trace_id":"t-1"}"#
            .to_string(),
    });

    let report = harness
        .dispatch(json!({
            "action": "send_group_msg",
            "echo": "e-1",
            "params": {"group_id": group_of(&recorded), "message": "pong"}
        }))
        .await;
    assert_eq!(report["status"], json!("failed"));
    assert_eq!(report["retcode"], json!(-1));
    assert_eq!(report["echo"], json!("e-1"));
    assert_eq!(
        report["message"],
        json!("code:850026, message:download failed, err_code:0")
    );

    let calls = harness.api.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].message.content,
        "message send failed: code:850026, message:download failed, err_code:0"
    );
    assert_eq!(calls[1].message.msg_id.as_deref(), Some("mA"));
}

#[tokio::test]
async fn regression_soft_failure_reports_success_without_notice() {
    let harness = Harness::new(CorrelationMode::Echo);
    let recorded = harness.record(ConversationKind::Group, "mA", "UA", Some("G1"), "hi");
    harness.api.fail_next(UpstreamApiError::Status {
        status: 400,
        body: r#"{"code":304023,"message":"under review","err_code":0}"#.to_string(),
    });

    let report = harness
        .dispatch(json!({
            "action": "send_group_msg",
            "params": {"group_id": group_of(&recorded), "message": "pong"}
        }))
        .await;
    assert_eq!(report["status"], json!("ok"));
    assert_eq!(report["retcode"], json!(0));
    assert_eq!(harness.api.calls().len(), 1);
}

#[tokio::test]
async fn functional_private_conversations_post_c2c_with_user_window() {
    let harness = Harness::new(CorrelationMode::Echo);
    let recorded = harness.record(ConversationKind::GroupPrivate, "mC", "UC", None, "hello");

    harness
        .dispatch(json!({
            "action": "send_msg",
            "params": {
                "user_id": recorded.user_id,
                "message": {"type": "text", "data": {"text": "hi"}}
            }
        }))
        .await;
    // Private chats presented as groups come back through send_group_msg.
    harness
        .dispatch(json!({
            "action": "send_group_msg",
            "params": {"group_id": recorded.user_id, "message": "again"}
        }))
        .await;
    harness
        .dispatch(json!({
            "action": "send_private_msg",
            "params": {"user_id": recorded.user_id.to_string(), "message": "third"}
        }))
        .await;

    let calls = harness.api.calls();
    assert_eq!(calls.len(), 3);
    for call in &calls {
        assert_eq!(call.route, "c2c");
        assert_eq!(call.target, "UC");
        assert_eq!(call.message.msg_id.as_deref(), Some("mC"));
    }
}

#[tokio::test]
async fn functional_guild_posts_to_channel_and_guild_private_is_unsupported() {
    let harness = Harness::new(CorrelationMode::Echo);
    let channel = harness.record(ConversationKind::Guild, "mG", "UG", Some("CH1"), "hey");
    let direct = harness.record(ConversationKind::GuildPrivate, "mD", "UD", None, "psst");

    let report = harness
        .dispatch(json!({
            "action": "send_group_msg",
            "params": {"group_id": group_of(&channel), "message": "pong"}
        }))
        .await;
    assert_eq!(report["retcode"], json!(0));

    let unsupported = harness
        .dispatch(json!({
            "action": "send_private_msg",
            "params": {"user_id": direct.user_id, "message": "pong"}
        }))
        .await;
    assert_eq!(unsupported["retcode"], json!(-1));

    let calls = harness.api.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].route, "channel");
    assert_eq!(calls[0].target, "CH1");
    assert_eq!(calls[0].message.msg_id.as_deref(), Some("mG"));
}

#[tokio::test]
async fn regression_empty_message_fails_without_consuming_reply_window() {
    let harness = Harness::new(CorrelationMode::Echo);
    let recorded = harness.record(ConversationKind::Group, "mA", "UA", Some("G1"), "hi");
    let group_id = group_of(&recorded);

    let report = harness
        .dispatch(json!({
            "action": "send_group_msg",
            "params": {"group_id": group_id, "message": [{"type": "image", "data": {}}]}
        }))
        .await;
    assert_eq!(report["retcode"], json!(-1));
    assert_eq!(harness.store.pending_len(group_id), 1);
    assert!(harness.api.calls().is_empty());
}

#[tokio::test]
async fn regression_unknown_or_malformed_group_id_is_reported() {
    let harness = Harness::new(CorrelationMode::Echo);
    let unknown = harness
        .dispatch(json!({
            "action": "send_group_msg",
            "params": {"group_id": 999, "message": "pong"}
        }))
        .await;
    assert_eq!(unknown["message"], json!("unknown group_id 999"));

    let malformed = harness
        .dispatch(json!({
            "action": "send_group_msg",
            "params": {"group_id": "abc", "message": "pong"}
        }))
        .await;
    assert_eq!(malformed["retcode"], json!(-1));
    assert!(harness.api.calls().is_empty());
}

#[tokio::test]
async fn unit_get_status_reports_connection_state() {
    let harness = Harness::new(CorrelationMode::Echo);
    let report = harness
        .dispatch(json!({"action": "get_status", "echo": {"n": 1}}))
        .await;
    assert_eq!(report["data"], json!({"online": true, "good": true}));
    assert_eq!(report["echo"], json!({"n": 1}));
}

#[tokio::test]
async fn regression_posted_message_ids_are_reported_without_growing_id_store() {
    let harness = Harness::new(CorrelationMode::Echo);
    let recorded = harness.record(ConversationKind::Group, "mA", "UA", Some("G1"), "hi");
    let mapped = harness.ids.len();

    let mut reported = Vec::new();
    for _ in 0..3 {
        let report = harness
            .dispatch(json!({
                "action": "send_group_msg",
                "params": {"group_id": group_of(&recorded), "message": "pong"}
            }))
            .await;
        reported.push(report["data"]["message_id"].as_i64().expect("message id"));
    }

    assert!(reported.iter().all(|id| *id > 0));
    reported.dedup();
    assert_eq!(reported.len(), 3);
    assert_eq!(harness.ids.len(), mapped);
}
