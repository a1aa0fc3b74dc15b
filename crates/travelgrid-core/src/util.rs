//! Shared utility functions used across multiple modules.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{Error, Result};

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Trim a required text field, failing with the field name when blank.
pub fn require_text(value: &str, field: &str) -> Result<String> {
    normalize_text_option(Some(value.to_string()))
        .ok_or_else(|| Error::InvalidInput(format!("{field} is required")))
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert stored Unix milliseconds back to a UTC timestamp.
pub fn datetime_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

/// Read a client timestamp given as RFC 3339 text or Unix milliseconds.
///
/// `null` means absent; anything else that does not parse fails with the
/// field name.
pub fn timestamp_from_value(value: &Value, field: &str) -> Result<Option<DateTime<Utc>>> {
    let invalid = || {
        Error::InvalidInput(format!(
            "{field} must be an RFC 3339 string or Unix milliseconds"
        ))
    };
    match value {
        Value::Null => Ok(None),
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| invalid()),
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(Some)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Stable per-process hash of a user ID for log lines.
pub fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}
