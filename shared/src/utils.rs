//! Utility functions for the dispatch system
//!
//! Common helpers used across the server: unix timestamps, id generation,
//! and the boundary normalization coercions applied to loosely-typed fields
//! arriving from agents.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Generate a new row id (UUID v4, hyphenated)
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Coerce a loosely-typed JSON value to a boolean.
///
/// Null and the empty string map to `None`. The strings "yes", "y", "1" and
/// "true" (case-insensitive) map to `true`; any other string maps to
/// `false`. Numbers are truthy when non-zero.
pub fn to_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some(matches!(
                trimmed.to_ascii_lowercase().as_str(),
                "yes" | "y" | "1" | "true"
            ))
        }
        _ => None,
    }
}

/// Coerce a loosely-typed JSON value to a number.
///
/// Null, the empty string, and unparseable strings map to `None`.
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => None,
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Coerce a loosely-typed JSON value to a unix timestamp.
///
/// Numbers are taken as unix seconds. Strings are parsed as RFC 3339 first,
/// then as a bare `YYYY-MM-DD` date (midnight UTC), then as a stringified
/// unix timestamp. Null, the empty string, and unparseable strings map to
/// `None`.
pub fn to_date(value: &Value) -> Option<i64> {
    match value {
        Value::Null => None,
        Value::Number(_) => to_number(value).map(|f| f as i64),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(dt.timestamp());
            }
            if let Some(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
            {
                return Some(date.and_utc().timestamp());
            }
            // Agents frequently stringify unix timestamps.
            to_number(value).map(|f| f as i64)
        }
        _ => None,
    }
}
