//! Plain-text extraction from OneBot message payloads.

use serde_json::Value;

/// Text of a `message` param given as a string, a segment array or a single
/// segment object. Non-text segments are skipped.
pub fn extract_text(message: Option<&Value>) -> String {
    match message {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(segments)) => segments.iter().filter_map(segment_text).collect(),
        Some(segment @ Value::Object(_)) => segment_text(segment).unwrap_or_default(),
        Some(other) => other.to_string(),
    }
}

fn segment_text(segment: &Value) -> Option<String> {
    if segment.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    segment
        .get("data")
        .and_then(|data| data.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Drops `<@...>` mention tags the platform puts in front of at-messages.
pub fn strip_leading_mentions(text: &str) -> &str {
    let mut rest = text.trim_start();
    while rest.starts_with("<@") {
        match rest.find('>') {
            Some(end) => rest = rest[end + 1..].trim_start(),
            None => break,
        }
    }
    rest.trim_end()
}

/// Text with leading whitespace and command slashes removed.
pub fn strip_command_prefix(text: &str) -> &str {
    text.trim_start().trim_start_matches('/').trim_start()
}

/// True when `text` starts with one of `whitelist`. An empty whitelist
/// allows everything.
pub fn is_whitelisted(text: &str, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let text = strip_command_prefix(text);
    whitelist
        .iter()
        .map(|entry| strip_command_prefix(entry))
        .filter(|entry| !entry.is_empty())
        .any(|entry| text.starts_with(entry))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{extract_text, is_whitelisted, strip_command_prefix, strip_leading_mentions};

    #[test]
    fn unit_extract_text_accepts_all_payload_shapes() {
        assert_eq!(extract_text(Some(&json!("hello"))), "hello");
        assert_eq!(
            extract_text(Some(&json!([
                {"type": "text", "data": {"text": "a"}},
                {"type": "image", "data": {"file": "x.png"}},
                {"type": "text", "data": {"text": "b"}}
            ]))),
            "ab"
        );
        assert_eq!(
            extract_text(Some(&json!({"type": "text", "data": {"text": "one"}}))),
            "one"
        );
        assert_eq!(extract_text(Some(&json!({"type": "face"}))), "");
        assert_eq!(extract_text(None), "");
    }

    #[test]
    fn unit_command_prefix_and_whitelist() {
        assert_eq!(strip_command_prefix("  /help me"), "help me");
        let whitelist = vec!["/help".to_string(), "status".to_string()];
        assert!(is_whitelisted(" /help", &whitelist));
        assert!(is_whitelisted("status now", &whitelist));
        assert!(!is_whitelisted("ban everyone", &whitelist));
        assert!(is_whitelisted("anything", &[]));
    }

    #[test]
    fn unit_leading_mentions_are_stripped() {
        assert_eq!(strip_leading_mentions("<@!1234> <@!99> /help "), "/help");
        assert_eq!(strip_leading_mentions(" plain text"), "plain text");
        assert_eq!(strip_leading_mentions("<@broken"), "<@broken");
        assert_eq!(strip_leading_mentions("hi <@!1>"), "hi <@!1>");
    }
}
