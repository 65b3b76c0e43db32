//! Correlation between upstream inbound messages and downstream replies.
//!
//! [`CorrelationStore`] holds the time-bounded tables, [`InboundEventRecorder`]
//! fills them as upstream events arrive and [`ReplyResolver`] reads them back
//! when a downstream bot replies.

pub mod correlation_key;
pub mod correlation_store;
pub mod inbound_recorder;
pub mod reply_resolution;

pub use correlation_key::{bare_token_suffix, numeric_correlation_key, token_correlation_key};
pub use correlation_store::{
    CorrelationStore, CorrelationStoreConfig, CorrelationStoreStats, PendingMessage, SweepReport,
};
pub use inbound_recorder::{
    InboundEventRecorder, InboundMessageEvent, InboundRecorderConfig, RecordError,
    RecordedInbound, TokenStyle,
};
pub use reply_resolution::{ReplyQuery, ReplyResolver, ReplySource, ReplyTarget};
