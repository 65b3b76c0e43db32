//! Wires the correlation store, downstream connection, dispatcher and webhook
//! into one running gateway.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use onegate_connection::{
    ConnectionManager, ConnectionState, InboundFrame, Session, SessionFactory, WsSessionFactory,
};
use onegate_core::{IdStore, MemoryIdStore, MessageSink};
use onegate_correlation::{CorrelationStore, InboundEventRecorder};
use onegate_dispatch::ActionDispatcher;
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    action_handlers::{register_default_handlers, GatewayContext},
    event_forwarder::{EventForwarder, ForwarderSettings},
    gateway_config::GatewayConfig,
    upstream_api::{HttpUpstreamApi, UpstreamApi},
    webhook_ingress::{build_webhook_router, WebhookSigner, WebhookState},
};

pub struct Gateway {
    config: GatewayConfig,
    store: CorrelationStore,
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<ActionDispatcher>,
    webhook: Arc<WebhookState>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundFrame>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Builds a gateway that dials the configured websocket and posts to the
    /// configured upstream API.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let api = HttpUpstreamApi::new(&config.api_base, &config.bot_token, config.http_timeout())?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let factory = WsSessionFactory::new(config.ws_session_config(), inbound_tx);
        Ok(Self::with_parts(
            config,
            Arc::new(api),
            Arc::new(factory),
            inbound_rx,
        ))
    }

    /// Builds a gateway from explicit collaborators. `inbound_rx` must receive
    /// the frames of sessions produced by `factory`.
    pub fn with_parts(
        config: GatewayConfig,
        api: Arc<dyn UpstreamApi>,
        factory: Arc<dyn SessionFactory>,
        inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
    ) -> Self {
        let store = CorrelationStore::new(config.store_config());
        let ids: Arc<dyn IdStore> = Arc::new(MemoryIdStore::new(config.id_allocation()));
        let manager = Arc::new(ConnectionManager::new(factory, config.connection_config()));

        let context = Arc::new(GatewayContext::new(
            store.clone(),
            Arc::clone(&ids),
            Arc::clone(&api),
            manager.clone(),
            config.app_id_string(),
            config.correlation_mode(),
        ));
        let mut dispatcher = ActionDispatcher::new();
        register_default_handlers(&mut dispatcher, context);

        let recorder = InboundEventRecorder::new(store.clone(), ids, config.recorder_config());
        let forwarder = EventForwarder::new(
            recorder,
            api,
            manager.clone(),
            ForwarderSettings::from_config(&config),
        );
        let signer = config
            .app_secret
            .as_deref()
            .and_then(WebhookSigner::from_secret);
        let webhook = Arc::new(WebhookState::new(
            Arc::new(forwarder),
            signer,
            manager.clone(),
        ));

        Self {
            config,
            store,
            manager,
            dispatcher: Arc::new(dispatcher),
            webhook,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            pump: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &CorrelationStore {
        &self.store
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn router(&self) -> Router {
        build_webhook_router(Arc::clone(&self.webhook))
    }

    /// Starts the connection manager and the downstream frame pump.
    pub fn start(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .context("gateway requires an active Tokio runtime")?;
        self.manager.start()?;
        let inbound_rx = self
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(inbound_rx) = inbound_rx {
            let pump = handle.spawn(pump_inbound_frames(
                inbound_rx,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.manager),
            ));
            *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);
        }
        info!(
            app_id = self.config.app_id,
            ws_address = %self.config.ws_address,
            mode = self.config.correlation_mode().field_name(),
            "gateway started"
        );
        Ok(())
    }

    /// Stops the downstream connection (bounded by the close grace period)
    /// and the frame pump.
    pub async fn stop(&self) {
        self.manager.stop().await;
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
        info!("gateway stopped");
    }
}

/// Reports for one session, pinned even if the manager has moved on.
struct SessionReply(Arc<dyn Session>);

#[async_trait]
impl MessageSink for SessionReply {
    async fn send_message(&self, payload: Value) -> Result<()> {
        self.0.send_message(payload).await
    }
}

/// Dispatches every downstream frame in its own task. Reports go to the
/// session the frame arrived on, or to the current session if that one is
/// already gone.
async fn pump_inbound_frames(
    mut inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
    dispatcher: Arc<ActionDispatcher>,
    manager: Arc<ConnectionManager>,
) {
    while let Some(frame) = inbound_rx.recv().await {
        let reply: Arc<dyn MessageSink> = match manager.active_session() {
            Some(session) if session.session_id() == frame.session_id => {
                Arc::new(SessionReply(session))
            }
            _ => {
                debug!(
                    session_id = frame.session_id,
                    "originating session is gone; reporting on the current session"
                );
                manager.clone()
            }
        };
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher.dispatch_frame(reply, &frame.text).await;
        });
    }
}

/// Serves the webhook on `listener` until `shutdown` resolves, then stops the
/// gateway.
pub async fn serve_gateway<F>(gateway: &Gateway, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let served = axum::serve(listener, gateway.router())
        .with_graceful_shutdown(shutdown)
        .await
        .context("webhook server exited unexpectedly");
    gateway.stop().await;
    served
}

/// Runs the gateway until ctrl-c.
pub async fn run_gateway(config: GatewayConfig) -> Result<()> {
    let gateway = Gateway::new(config)?;
    let bind = gateway.config().webhook_bind.clone();
    let listener = TcpListener::bind(bind.as_str())
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve webhook bound address")?;
    gateway.start()?;
    info!(addr = %local_addr, "webhook server listening");
    serve_gateway(&gateway, listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use onegate_connection::ConnectionState;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::{serve_gateway, Gateway};
    use crate::gateway_config::GatewayConfig;

    fn unreachable_config() -> GatewayConfig {
        let mut config = GatewayConfig::new(102005, "tok", "ws://127.0.0.1:9/onebot");
        config.reconnect_interval_ms = 50;
        config.api_base = "http://127.0.0.1:9".to_string();
        config
    }

    #[test]
    fn regression_invalid_config_is_rejected_before_wiring() {
        let mut config = unreachable_config();
        config.bot_token = String::new();
        assert!(Gateway::new(config).is_err());
    }

    #[test]
    fn regression_start_outside_runtime_fails_cleanly() {
        let gateway = Gateway::new(unreachable_config()).expect("gateway");
        assert!(gateway.start().is_err());
    }

    #[tokio::test]
    async fn functional_unreachable_downstream_keeps_retrying_and_stops_bounded() {
        let gateway = Gateway::new(unreachable_config()).expect("gateway");
        assert_eq!(gateway.connection_state(), ConnectionState::Idle);
        gateway.start().expect("start");
        gateway.start().expect("second start is a no-op");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_ne!(gateway.connection_state(), ConnectionState::Connected);

        let started = Instant::now();
        gateway.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(gateway.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn integration_serve_gateway_exposes_healthz_until_shutdown() {
        let gateway = Gateway::new(unreachable_config()).expect("gateway");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve_gateway(&gateway, listener, async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        let body = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("get healthz")
            .json::<Value>()
            .await
            .expect("json");
        assert_eq!(body, json!({"status": "ok", "connection": "idle"}));

        let _ = shutdown_tx.send(());
        server.await.expect("join").expect("serve");
    }
}
