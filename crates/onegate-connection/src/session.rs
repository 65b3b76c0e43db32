use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use onegate_core::MessageSink;
use tokio::sync::watch;

#[async_trait]
/// One live bidirectional transport to the downstream bot.
pub trait Session: MessageSink {
    fn session_id(&self) -> u64;

    /// Starts closing the transport. Completion is observed through
    /// [`Session::closed`], not through this future.
    async fn close(&self);

    /// Receiver that turns `true` once the session is closed for any reason.
    fn closed(&self) -> watch::Receiver<bool>;

    fn is_closed(&self) -> bool {
        *self.closed().borrow()
    }
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn Session>>;
}

#[derive(Debug)]
/// One-shot closed flag shared by a session and everyone watching it.
pub struct SessionCloseSignal {
    tx: watch::Sender<bool>,
}

impl Default for SessionCloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Marks the session closed. Returns `true` only for the call that
    /// actually flipped the flag.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves once `closed` reads `true` or its sender is gone.
pub async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}
