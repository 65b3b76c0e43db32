use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use httpmock::prelude::*;
use onegate_gateway::{Gateway, GatewayConfig};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage, WebSocketStream};

const APP_ID: u64 = 102005;

type BotSocket = WebSocketStream<TcpStream>;

/// Listener standing in for the OneBot bot's reverse websocket endpoint.
async fn bind_bot() -> (SocketAddr, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind bot");
    let addr = listener.local_addr().expect("bot addr");
    (addr, listener)
}

async fn accept_bot(listener: &TcpListener) -> BotSocket {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("gateway dialed the bot")
        .expect("accept tcp");
    accept_async(stream).await.expect("websocket handshake")
}

/// Next frame that is not a meta event.
async fn next_non_meta(socket: &mut BotSocket) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame = serde_json::from_str::<Value>(text.as_str()).expect("json frame");
                    if frame["post_type"] == "meta_event" {
                        continue;
                    }
                    return frame;
                }
                Some(Ok(_)) => continue,
                other => panic!("bot stream ended: {other:?}"),
            }
        }
    })
    .await
    .expect("frame before timeout")
}

async fn send_action(socket: &mut BotSocket, action: Value) {
    socket
        .send(WsMessage::Text(action.to_string().into()))
        .await
        .expect("send action");
}

struct RunningGateway {
    gateway: Arc<Gateway>,
    webhook: SocketAddr,
}

async fn start_gateway(config: GatewayConfig) -> RunningGateway {
    let gateway = Arc::new(Gateway::new(config).expect("gateway"));
    gateway.start().expect("start gateway");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind webhook");
    let webhook = listener.local_addr().expect("webhook addr");
    let router = gateway.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve webhook");
    });
    RunningGateway { gateway, webhook }
}

async fn wait_connected(gateway: &Gateway) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.connection_state().as_str() != "connected" {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("gateway connected");
}

async fn post_event(webhook: SocketAddr, event_type: &str, data: Value) -> Value {
    reqwest::Client::new()
        .post(format!("http://{webhook}/webhook"))
        .json(&json!({"op": 0, "t": event_type, "d": data}))
        .send()
        .await
        .expect("post webhook")
        .json::<Value>()
        .await
        .expect("webhook ack")
}

fn gateway_config(bot: SocketAddr, upstream: &MockServer, use_request_id: bool) -> GatewayConfig {
    let mut config = GatewayConfig::new(APP_ID, "tok", format!("ws://{bot}/onebot"));
    config.api_base = upstream.base_url();
    config.use_request_id = Some(use_request_id);
    config.reconnect_interval_ms = 50;
    config
}

#[tokio::test]
async fn integration_group_message_round_trips_through_echo_correlation() {
    let upstream = MockServer::start();
    let post = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v2/groups/GROUP-A/messages")
            .header("authorization", "QQBot tok")
            .json_body_includes(r#"{"content": "pong", "msg_id": "ROBOT1.0_in-1"}"#);
        then.status(200)
            .json_body(json!({"id": "ROBOT1.0_out-1", "timestamp": 1}));
    });

    let (bot_addr, bot_listener) = bind_bot().await;
    let running = start_gateway(gateway_config(bot_addr, &upstream, false)).await;
    let mut bot = accept_bot(&bot_listener).await;
    wait_connected(&running.gateway).await;

    let ack = post_event(
        running.webhook,
        "GROUP_AT_MESSAGE_CREATE",
        json!({
            "id": "ROBOT1.0_in-1",
            "content": " ping",
            "group_openid": "GROUP-A",
            "author": {"member_openid": "MEMBER-1"}
        }),
    )
    .await;
    assert_eq!(ack, json!({"op": 12}));

    let event = next_non_meta(&mut bot).await;
    assert_eq!(event["post_type"], "message");
    assert_eq!(event["message_type"], "group");
    assert_eq!(event["raw_message"], "ping");
    assert_eq!(event["self_id"], APP_ID);
    let group_id = event["group_id"].clone();
    let echo = event["echo"].clone();
    assert!(echo.is_string());

    send_action(
        &mut bot,
        json!({
            "action": "send_group_msg",
            "params": {"group_id": group_id.to_string(), "message": "pong"},
            "echo": echo
        }),
    )
    .await;
    let report = next_non_meta(&mut bot).await;
    assert_eq!(report["status"], "ok");
    assert_eq!(report["retcode"], 0);
    assert_eq!(report["echo"], echo);
    assert!(report["data"]["message_id"].as_i64().expect("message id") > 0);
    post.assert_calls(1);

    running.gateway.stop().await;
}

#[tokio::test]
async fn integration_request_id_mode_reports_real_failure_and_notifies_group() {
    let upstream = MockServer::start();
    let reply = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v2/groups/GROUP-B/messages")
            .json_body_includes(r#"{"content": "pong"}"#);
        then.status(400)
            .json_body(json!({"code": 11255, "message": "invalid request", "err_code": 1}));
    });
    let notice = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v2/groups/GROUP-B/messages")
            .json_body_includes(
                r#"{"content": "message send failed: code:11255, message:invalid request, err_code:1", "msg_id": "ROBOT1.0_in-2"}"#,
            );
        then.status(200).json_body(json!({"id": "ROBOT1.0_notice"}));
    });

    let (bot_addr, bot_listener) = bind_bot().await;
    let running = start_gateway(gateway_config(bot_addr, &upstream, true)).await;
    let mut bot = accept_bot(&bot_listener).await;
    wait_connected(&running.gateway).await;

    post_event(
        running.webhook,
        "GROUP_AT_MESSAGE_CREATE",
        json!({
            "id": "ROBOT1.0_in-2",
            "content": "ping",
            "group_openid": "GROUP-B",
            "author": {"member_openid": "MEMBER-2"}
        }),
    )
    .await;
    let event = next_non_meta(&mut bot).await;
    let request_id = event["request_id"].as_str().expect("request id").to_string();
    assert!(event.get("echo").is_none());

    send_action(
        &mut bot,
        json!({
            "action": "send_group_msg",
            "params": {"group_id": event["group_id"], "message": [{"type": "text", "data": {"text": "pong"}}]},
            "request_id": request_id
        }),
    )
    .await;
    let report = next_non_meta(&mut bot).await;
    assert_eq!(report["status"], "failed");
    assert_eq!(report["retcode"], -1);
    assert_eq!(report["request_id"], request_id);
    reply.assert_calls(1);
    notice.assert_calls(1);

    running.gateway.stop().await;
}
