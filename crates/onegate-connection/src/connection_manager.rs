//! Supervises exactly one downstream session at a time.
//!
//! A single control task walks `Idle -> Connecting -> Connected -> Closing ->
//! Idle`. It never opens a session while another is held, and every held
//! session is closed (bounded by the grace period) before the next dial.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use onegate_core::MessageSink;
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::session::{wait_closed, Session, SessionFactory};

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionManagerConfig {
    /// Wait between a failed dial (or a lost session) and the next dial.
    pub reconnect_interval: Duration,
    /// Upper bound on waiting for a session to report closed.
    pub close_grace: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

struct ManagerSlot {
    state: ConnectionState,
    current: Option<Arc<dyn Session>>,
}

struct ManagerShared {
    slot: Mutex<ManagerSlot>,
    sessions_opened: AtomicU64,
}

impl ManagerShared {
    fn lock(&self) -> MutexGuard<'_, ManagerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }

    fn hold(&self, session: Arc<dyn Session>) {
        let mut slot = self.lock();
        slot.current = Some(session);
        slot.state = ConnectionState::Connected;
    }

    fn release(&self) -> Option<Arc<dyn Session>> {
        let mut slot = self.lock();
        slot.state = ConnectionState::Closing;
        slot.current.take()
    }
}

struct ManagerControl {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the supervisory loop and the one current session.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    factory: Arc<dyn SessionFactory>,
    shared: Arc<ManagerShared>,
    control: Mutex<Option<ManagerControl>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn SessionFactory>, config: ConnectionManagerConfig) -> Self {
        Self {
            config,
            factory,
            shared: Arc::new(ManagerShared {
                slot: Mutex::new(ManagerSlot {
                    state: ConnectionState::Idle,
                    current: None,
                }),
                sessions_opened: AtomicU64::new(0),
            }),
            control: Mutex::new(None),
        }
    }

    pub fn config(&self) -> ConnectionManagerConfig {
        self.config
    }

    /// Spawns the supervisory loop and returns immediately. Calling it while
    /// the loop is already running does nothing.
    pub fn start(&self) -> Result<()> {
        let mut control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if control.is_some() {
            return Ok(());
        }
        let handle = tokio::runtime::Handle::try_current()
            .context("connection manager requires an active Tokio runtime")?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = handle.spawn(run_connection_loop(
            Arc::clone(&self.factory),
            Arc::clone(&self.shared),
            self.config,
            stop_rx,
        ));
        *control = Some(ManagerControl { stop_tx, task });
        Ok(())
    }

    /// Signals shutdown and waits for the loop to exit. Bounded by the close
    /// grace period even when the held session never reports closed.
    pub async fn stop(&self) {
        let control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(control) = control else {
            return;
        };
        let _ = control.stop_tx.send(true);
        if let Err(error) = control.task.await {
            warn!(%error, "connection loop task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn active_session(&self) -> Option<Arc<dyn Session>> {
        self.shared.lock().current.clone()
    }

    /// Number of sessions successfully opened since construction.
    pub fn sessions_opened(&self) -> u64 {
        self.shared.sessions_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSink for ConnectionManager {
    async fn send_message(&self, payload: Value) -> Result<()> {
        let session = self
            .active_session()
            .context("no live downstream session")?;
        session.send_message(payload).await
    }
}

async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

async fn close_within_grace(session: &Arc<dyn Session>, grace: Duration) -> bool {
    let mut closed_rx = session.closed();
    let closing = async {
        session.close().await;
        wait_closed(&mut closed_rx).await;
    };
    match tokio::time::timeout(grace, closing).await {
        Ok(()) => true,
        Err(_) => {
            warn!(
                session_id = session.session_id(),
                grace_ms = grace.as_millis() as u64,
                "session did not close within grace period; abandoning it"
            );
            false
        }
    }
}

async fn run_connection_loop(
    factory: Arc<dyn SessionFactory>,
    shared: Arc<ManagerShared>,
    config: ConnectionManagerConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        shared.set_state(ConnectionState::Connecting);
        let opened = tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => break,
            opened = factory.open() => opened,
        };

        match opened {
            Ok(session) => {
                let session_id = session.session_id();
                let mut closed_rx = session.closed();
                shared.sessions_opened.fetch_add(1, Ordering::SeqCst);
                shared.hold(Arc::clone(&session));
                info!(session_id, "downstream session connected");

                let stopping = tokio::select! {
                    biased;
                    _ = stop_requested(&mut stop_rx) => true,
                    _ = wait_closed(&mut closed_rx) => false,
                };

                if let Some(session) = shared.release() {
                    close_within_grace(&session, config.close_grace).await;
                }
                if stopping {
                    debug!(session_id, "downstream session closed for shutdown");
                    break;
                }
                warn!(session_id, "downstream session closed; reconnecting");
            }
            Err(error) => {
                warn!(error = %format!("{error:#}"), "failed to open downstream session");
            }
        }

        shared.set_state(ConnectionState::Idle);
        tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => break,
            _ = tokio::time::sleep(config.reconnect_interval) => {}
        }
    }
    shared.set_state(ConnectionState::Idle);
    info!("connection manager stopped");
}
