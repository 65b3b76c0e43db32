//! Downstream transport: the session contracts, the single-session
//! connection manager and the reverse-websocket session implementation.

pub mod connection_manager;
pub mod session;
pub mod ws_session;

pub use connection_manager::{ConnectionManager, ConnectionManagerConfig, ConnectionState};
pub use session::{wait_closed, Session, SessionCloseSignal, SessionFactory};
pub use ws_session::{
    heartbeat_event, lifecycle_connect_event, InboundFrame, WsSession, WsSessionConfig,
    WsSessionFactory, DEFAULT_USER_AGENT,
};
