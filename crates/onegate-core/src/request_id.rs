use uuid::Uuid;

/// Mints an opaque correlation id: `<unix millis>-<uuid v4>`.
///
/// Never reused, unlike the upstream sequence number, so two events can not
/// collide on the same correlation key.
pub fn new_request_id(now_unix_ms: u64) -> String {
    format!("{now_unix_ms}-{}", Uuid::new_v4())
}
