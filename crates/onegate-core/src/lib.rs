//! Foundational types shared across onegate crates.
//!
//! Provides time helpers with an injectable clock, the conversation and
//! correlation-mode vocabulary, opaque request-id minting, the identifier store
//! contract, and the outbound message sink contract.

pub mod conversation;
pub mod id_store;
pub mod message_sink;
pub mod request_id;
pub mod time_utils;

pub use conversation::{ConversationKind, CorrelationMode};
pub use id_store::{IdAllocation, IdStore, IdStoreError, MemoryIdStore};
pub use message_sink::MessageSink;
pub use request_id::new_request_id;
pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, is_older_than, Clock, ManualClock,
    SystemClock,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_utils_round_trip_bounds() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn is_older_than_respects_strict_bound() {
        assert!(!is_older_than(1_000, 600, 1_600));
        assert!(is_older_than(1_000, 600, 1_601));
        assert!(!is_older_than(2_000, 600, 1_000));
    }

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new(5_000);
        assert_eq!(clock.now_unix_ms(), 5_000);
        clock.advance_ms(250);
        assert_eq!(clock.now_unix_ms(), 5_250);
        clock.set_ms(10);
        assert_eq!(clock.now_unix_ms(), 10);
    }
}
