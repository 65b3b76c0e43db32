//! Reverse-websocket session towards a OneBot v11 style bot.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use onegate_core::{current_unix_timestamp, MessageSink};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{
            header::{AUTHORIZATION, USER_AGENT},
            HeaderValue, Request,
        },
        Message as WsMessage,
    },
};
use tracing::{debug, warn};

use crate::session::{Session, SessionCloseSignal, SessionFactory};

const CLIENT_ROLE_UNIVERSAL: &str = "Universal";
pub const DEFAULT_USER_AGENT: &str = concat!("onegate/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
/// A text frame received from the bot.
pub struct InboundFrame {
    pub session_id: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsSessionConfig {
    pub address: String,
    pub self_id: u64,
    /// Sent as `Authorization: Token <token>` when present.
    pub access_token: Option<String>,
    pub user_agent: String,
    pub heartbeat_interval: Duration,
}

enum WriterCommand {
    Frame(WsMessage),
    Close,
}

pub fn lifecycle_connect_event(self_id: u64) -> Value {
    json!({
        "post_type": "meta_event",
        "meta_event_type": "lifecycle",
        "sub_type": "connect",
        "self_id": self_id,
        "time": current_unix_timestamp(),
    })
}

pub fn heartbeat_event(self_id: u64, interval: Duration) -> Value {
    json!({
        "post_type": "meta_event",
        "meta_event_type": "heartbeat",
        "self_id": self_id,
        "time": current_unix_timestamp(),
        "interval": interval.as_millis() as u64,
        "status": {
            "online": true,
            "good": true,
        },
    })
}

/// Dials the configured address each time the connection manager asks for a
/// session. Text frames from every session go to one shared channel.
pub struct WsSessionFactory {
    config: WsSessionConfig,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    next_session_id: AtomicU64,
}

impl WsSessionFactory {
    pub fn new(config: WsSessionConfig, inbound_tx: mpsc::UnboundedSender<InboundFrame>) -> Self {
        Self {
            config,
            inbound_tx,
            next_session_id: AtomicU64::new(1),
        }
    }

    fn build_request(&self) -> Result<Request<()>> {
        let mut request = self
            .config
            .address
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid websocket address '{}'", self.config.address))?;
        let headers = request.headers_mut();
        headers.insert(
            "x-self-id",
            HeaderValue::from_str(&self.config.self_id.to_string())
                .context("invalid X-Self-ID header")?,
        );
        headers.insert("x-client-role", HeaderValue::from_static(CLIENT_ROLE_UNIVERSAL));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent).context("invalid user agent header")?,
        );
        if let Some(token) = self
            .config
            .access_token
            .as_deref()
            .filter(|token| !token.is_empty())
        {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Token {token}"))
                    .context("invalid authorization header")?,
            );
        }
        Ok(request)
    }
}

#[async_trait]
impl SessionFactory for WsSessionFactory {
    async fn open(&self) -> Result<Arc<dyn Session>> {
        let request = self.build_request()?;
        let (stream, _response) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect to {}", self.config.address))?;
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = WsSession::spawn(
            session_id,
            stream,
            self.config.clone(),
            self.inbound_tx.clone(),
        );
        session
            .send_message(lifecycle_connect_event(self.config.self_id))
            .await?;
        Ok(session as Arc<dyn Session>)
    }
}

/// Live websocket session. A reader, a writer and a heartbeat task run until
/// the socket closes or [`Session::close`] is called.
pub struct WsSession {
    session_id: u64,
    outbound_tx: mpsc::UnboundedSender<WriterCommand>,
    signal: Arc<SessionCloseSignal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsSession {
    fn spawn<S>(
        session_id: u64,
        stream: S,
        config: WsSessionConfig,
        inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    ) -> Arc<Self>
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WriterCommand>();
        let signal = Arc::new(SessionCloseSignal::new());

        let writer_signal = Arc::clone(&signal);
        let writer = tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                match command {
                    WriterCommand::Frame(frame) => {
                        if let Err(error) = sink.send(frame).await {
                            warn!(session_id, %error, "websocket write failed");
                            break;
                        }
                    }
                    WriterCommand::Close => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
            writer_signal.fire();
        });

        let reader_signal = Arc::clone(&signal);
        let pong_tx = outbound_tx.clone();
        let mut reader_closed = signal.subscribe();
        let reader = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_closed.wait_for(|closed| *closed) => break,
                    next = source.next() => next,
                };
                match next {
                    Some(Ok(WsMessage::Text(text))) => {
                        let frame = InboundFrame {
                            session_id,
                            text: text.as_str().to_string(),
                        };
                        if inbound_tx.send(frame).is_err() {
                            debug!(session_id, "inbound frame receiver dropped");
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if inbound_tx.send(InboundFrame { session_id, text }).is_err() {
                                break;
                            }
                        }
                        Err(_) => warn!(session_id, "dropping non-utf8 binary frame"),
                    },
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = pong_tx.send(WriterCommand::Frame(WsMessage::Pong(payload)));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(session_id, ?frame, "websocket closed by peer");
                        break;
                    }
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(error)) => {
                        warn!(session_id, %error, "websocket read failed");
                        break;
                    }
                    None => break,
                }
            }
            reader_signal.fire();
        });

        let heartbeat_tx = outbound_tx.clone();
        let mut heartbeat_closed = signal.subscribe();
        let heartbeat = tokio::spawn(async move {
            let interval = config.heartbeat_interval.max(Duration::from_millis(10));
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = heartbeat_closed.wait_for(|closed| *closed) => break,
                    _ = ticker.tick() => {
                        let frame = heartbeat_event(config.self_id, interval).to_string();
                        if heartbeat_tx
                            .send(WriterCommand::Frame(WsMessage::Text(frame.into())))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            session_id,
            outbound_tx,
            signal,
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        })
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl MessageSink for WsSession {
    async fn send_message(&self, payload: Value) -> Result<()> {
        if self.signal.is_fired() {
            anyhow::bail!("websocket session {} is closed", self.session_id);
        }
        self.outbound_tx
            .send(WriterCommand::Frame(WsMessage::Text(payload.to_string().into())))
            .map_err(|_| anyhow::anyhow!("websocket session {} writer has stopped", self.session_id))
    }
}

#[async_trait]
impl Session for WsSession {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn close(&self) {
        if self.outbound_tx.send(WriterCommand::Close).is_err() {
            self.signal.fire();
        }
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}
