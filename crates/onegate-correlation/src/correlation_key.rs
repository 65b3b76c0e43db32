//! Correlation keys share one string key space in the store:
//! numeric keys `<app_id>_<compact id>` and opaque tokens
//! `<app_id>_<millis>-<uuid>`.

/// Numeric key for a user or group compact id. Later events from the same
/// user overwrite it.
pub fn numeric_correlation_key(app_id: &str, numeric_id: i64) -> String {
    format!("{app_id}_{numeric_id}")
}

/// Opaque token key, unique per issued request id.
pub fn token_correlation_key(app_id: &str, request_id: &str) -> String {
    format!("{app_id}_{request_id}")
}

/// The part of a key after its `<app_id>_` prefix.
///
/// Some bots echo back only the bare request id, so tokens are recorded under
/// both forms.
pub fn bare_token_suffix(key: &str) -> Option<&str> {
    let (_, suffix) = key.split_once('_')?;
    (!suffix.is_empty()).then_some(suffix)
}
