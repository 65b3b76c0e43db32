//! QQ bot platform to OneBot v11 gateway.
//!
//! Upstream events arrive on the webhook, are recorded for correlation and
//! forwarded to the downstream bot as OneBot message events. Downstream
//! actions are resolved back to upstream message ids and posted through the
//! upstream HTTP API.

pub mod action_handlers;
pub mod action_report;
pub mod event_forwarder;
pub mod gateway_config;
pub mod gateway_runtime;
pub mod message_content;
pub mod upstream_api;
pub mod webhook_ingress;

pub use action_handlers::{register_default_handlers, ConnectionStatus, GatewayContext};
pub use action_report::ActionReport;
pub use event_forwarder::{EventForwarder, ForwardOutcome, ForwarderSettings};
pub use gateway_config::{load_gateway_config, parse_gateway_config, GatewayConfig};
pub use gateway_runtime::{run_gateway, serve_gateway, Gateway};
pub use upstream_api::{
    FailureClass, HttpUpstreamApi, OutboundMessage, PostedMessage, UpstreamApi, UpstreamApiError,
};
pub use webhook_ingress::{build_webhook_router, parse_message_event, WebhookSigner, WebhookState};
