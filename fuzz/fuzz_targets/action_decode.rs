#![no_main]

use libfuzzer_sys::fuzz_target;
use onegate_dispatch::{best_effort_action_name, decode_action_message};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let best_effort = best_effort_action_name(&raw);

    match decode_action_message(&raw) {
        Ok(message) => {
            assert!(!message.action.trim().is_empty());
            if message.correlation_key.is_some() {
                assert!(message.request_id.is_some() && message.echo.is_some());
            }
            for id in [
                message.params.group_id.as_deref(),
                message.params.user_id.as_deref(),
                message.params.channel_id.as_deref(),
            ]
            .into_iter()
            .flatten()
            {
                assert!(!id.trim().is_empty());
            }
        }
        Err(error) => {
            assert!(!error.to_string().trim().is_empty());
            if let Some(action) = best_effort {
                assert!(!action.is_empty());
            }
        }
    }
});
