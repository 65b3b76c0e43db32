#![no_main]

use libfuzzer_sys::fuzz_target;
use onegate_gateway::parse_message_event;
use serde_json::Value;

const EVENT_TYPES: [&str; 5] = [
    "GROUP_AT_MESSAGE_CREATE",
    "C2C_MESSAGE_CREATE",
    "AT_MESSAGE_CREATE",
    "DIRECT_MESSAGE_CREATE",
    "GUILD_CREATE",
];

fuzz_target!(|data: &[u8]| {
    let Some((selector, body)) = data.split_first() else {
        return;
    };
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return;
    };
    let event_type = EVENT_TYPES[usize::from(*selector) % EVENT_TYPES.len()];
    if let Ok(Some(event)) = parse_message_event(event_type, &value) {
        assert!(!event.message_id.is_empty());
        assert!(!event.user_native_id.is_empty());
        assert_eq!(event.text, event.text.trim());
    }
});
