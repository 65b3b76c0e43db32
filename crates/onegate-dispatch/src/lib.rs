//! Flexible decoding of downstream action requests and routing them to
//! registered handlers.

pub mod action_decode;
pub mod action_dispatch;

pub use action_decode::{
    best_effort_action_name, decode_action_message, decode_action_value, ActionMessage,
    ActionParams, DecodeError, WireValue, ECHO_FIELD, REQUEST_ID_FIELD,
};
pub use action_dispatch::{ActionDispatcher, ActionHandler, DispatchOutcome};
