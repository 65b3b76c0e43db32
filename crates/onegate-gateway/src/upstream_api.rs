//! Upstream chat-platform message API and failure classification.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Rich-media download failed on the platform side.
const CODE_RICH_MEDIA_DOWNLOAD_FAILED: i64 = 850_026;
const CODE_RICH_MEDIA_REJECTED: i64 = 40_034_001;
/// Message held for asynchronous review; it is usually delivered anyway.
const CODE_UNDER_REVIEW: i64 = 304_023;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    pub msg_type: u8,
    pub msg_seq: u32,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>, msg_id: Option<String>, msg_seq: u32) -> Self {
        Self {
            content: content.into(),
            msg_id,
            msg_type: 0,
            msg_seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PostedMessage {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
/// Error body returned by the platform on a rejected request.
pub struct PlatformErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub err_code: i64,
}

#[derive(Debug, Error)]
pub enum UpstreamApiError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The message was not delivered.
    Real,
    /// Reported as an error but the message most likely went out.
    Soft,
}

impl UpstreamApiError {
    fn platform_body(&self) -> Option<PlatformErrorBody> {
        match self {
            Self::Status { body, .. } => serde_json::from_str::<PlatformErrorBody>(body).ok(),
            _ => None,
        }
    }

    fn status_code(&self) -> u16 {
        match self {
            Self::Status { status, .. } => *status,
            _ => 0,
        }
    }

    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Transport(_) | Self::Decode(_) => FailureClass::Real,
            Self::Status { status, .. } => match self.platform_body().map(|body| body.code) {
                Some(CODE_RICH_MEDIA_DOWNLOAD_FAILED) | Some(CODE_RICH_MEDIA_REJECTED) => {
                    FailureClass::Real
                }
                Some(CODE_UNDER_REVIEW) => FailureClass::Soft,
                _ if *status >= 400 => FailureClass::Real,
                _ => FailureClass::Soft,
            },
        }
    }

    pub fn is_real_failure(&self) -> bool {
        self.classify() == FailureClass::Real
    }

    /// Platform error fields only; request URLs, addresses and trace ids in the
    /// raw error never reach the bot.
    pub fn sanitized_message(&self) -> String {
        match self.platform_body() {
            Some(body) => format!(
                "code:{}, message:{}, err_code:{}",
                body.code, body.message, body.err_code
            ),
            None => format!("code:{}, request failed", self.status_code()),
        }
    }
}

#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn post_group_message(
        &self,
        group_openid: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError>;

    async fn post_c2c_message(
        &self,
        user_openid: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError>;

    async fn post_channel_message(
        &self,
        channel_id: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpUpstreamApi {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl HttpUpstreamApi {
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build upstream http client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
        })
    }

    async fn post_message(
        &self,
        path: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .post(url.as_str())
            .header("authorization", format!("QQBot {}", self.bot_token))
            .json(message)
            .send()
            .await
            .map_err(|error| UpstreamApiError::Transport(error.without_url().to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| UpstreamApiError::Transport(error.without_url().to_string()))?;
        if status.is_client_error() || status.is_server_error() || has_error_code(status, &body) {
            return Err(UpstreamApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(PostedMessage { id: None });
        }
        serde_json::from_str::<PostedMessage>(&body)
            .map_err(|error| UpstreamApiError::Decode(error.to_string()))
    }
}

/// The platform sometimes answers 200 with an error body.
fn has_error_code(status: StatusCode, body: &str) -> bool {
    status.is_success()
        && serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| value.get("code").and_then(Value::as_i64))
            .is_some_and(|code| code != 0)
}

#[async_trait]
impl UpstreamApi for HttpUpstreamApi {
    async fn post_group_message(
        &self,
        group_openid: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError> {
        self.post_message(&format!("/v2/groups/{group_openid}/messages"), message)
            .await
    }

    async fn post_c2c_message(
        &self,
        user_openid: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError> {
        self.post_message(&format!("/v2/users/{user_openid}/messages"), message)
            .await
    }

    async fn post_channel_message(
        &self,
        channel_id: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, UpstreamApiError> {
        self.post_message(&format!("/channels/{channel_id}/messages"), message)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use serde_json::json;

    use super::{FailureClass, HttpUpstreamApi, OutboundMessage, UpstreamApi, UpstreamApiError};

    fn status_error(status: u16, body: &str) -> UpstreamApiError {
        UpstreamApiError::Status {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn unit_classification_follows_platform_codes() {
        assert_eq!(
            status_error(400, r#"{"code":850026,"message":"download failed","err_code":1}"#)
                .classify(),
            FailureClass::Real
        );
        assert_eq!(
            status_error(200, r#"{"code":40034001,"message":"x"}"#).classify(),
            FailureClass::Real
        );
        assert_eq!(
            status_error(500, r#"{"code":304023,"message":"under review"}"#).classify(),
            FailureClass::Soft
        );
        assert_eq!(
            status_error(400, r#"{"code":11244,"message":"token invalid"}"#).classify(),
            FailureClass::Real
        );
        assert_eq!(
            status_error(200, r#"{"code":22009,"message":"rate"}"#).classify(),
            FailureClass::Soft
        );
        assert_eq!(status_error(502, "<html>").classify(), FailureClass::Real);
        assert!(UpstreamApiError::Transport("timeout".to_string()).is_real_failure());
    }

    #[test]
    fn regression_sanitized_message_never_leaks_raw_body() {
        let parsed = status_error(
            400,
            r#"{"code":850026,"message":"download failed","err_code":7,"trace_id":"abc","url":"http://10.0.0.1/x"}"#,
        );
        assert_eq!(
            parsed.sanitized_message(),
            "code:850026, message:download failed, err_code:7"
        );
        let opaque = status_error(503, "upstream 10.1.2.3 unreachable");
        assert_eq!(opaque.sanitized_message(), "code:503, request failed");
        let transport = UpstreamApiError::Transport("dns error for https://internal".to_string());
        assert_eq!(transport.sanitized_message(), "code:0, request failed");
    }

    #[tokio::test]
    async fn integration_group_message_posts_with_bot_authorization() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v2/groups/GROUP-OPENID/messages")
                .header("authorization", "QQBot tok")
                .json_body(json!({
                    "content": "pong",
                    "msg_id": "ROBOT1.0_m1",
                    "msg_type": 0,
                    "msg_seq": 3
                }));
            then.status(200)
                .json_body(json!({"id": "sent-1", "timestamp": 1}));
        });

        let api = HttpUpstreamApi::new(&server.base_url(), "tok", Duration::from_secs(2))
            .expect("api");
        let posted = api
            .post_group_message(
                "GROUP-OPENID",
                &OutboundMessage::text("pong", Some("ROBOT1.0_m1".to_string()), 3),
            )
            .await
            .expect("post");
        mock.assert();
        assert_eq!(posted.id.as_deref(), Some("sent-1"));
    }

    #[tokio::test]
    async fn integration_c2c_and_channel_paths_and_error_bodies() {
        let server = MockServer::start();
        let c2c = server.mock(|when, then| {
            when.method(POST).path("/v2/users/USER-OPENID/messages");
            then.status(400)
                .json_body(json!({"code": 304023, "message": "under review", "err_code": 0}));
        });
        let channel = server.mock(|when, then| {
            when.method(POST).path("/channels/CH-1/messages");
            then.status(200).body("");
        });

        let api = HttpUpstreamApi::new(&server.base_url(), "tok", Duration::from_secs(2))
            .expect("api");
        let error = api
            .post_c2c_message("USER-OPENID", &OutboundMessage::text("hi", None, 1))
            .await
            .expect_err("review error");
        assert_eq!(error.classify(), FailureClass::Soft);
        assert_eq!(
            error.sanitized_message(),
            "code:304023, message:under review, err_code:0"
        );

        let posted = api
            .post_channel_message("CH-1", &OutboundMessage::text("hi", None, 1))
            .await
            .expect("empty success body");
        assert_eq!(posted.id, None);
        c2c.assert();
        channel.assert();
    }

    #[tokio::test]
    async fn regression_success_status_with_error_code_is_a_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v2/groups/G/messages");
            then.status(200)
                .json_body(json!({"code": 850026, "message": "download failed"}));
        });
        let api = HttpUpstreamApi::new(&server.base_url(), "tok", Duration::from_secs(2))
            .expect("api");
        let error = api
            .post_group_message("G", &OutboundMessage::text("x", None, 1))
            .await
            .expect_err("error body");
        assert!(error.is_real_failure());
    }
}
