use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

use crate::error::{Result, StoreError};

/// Accepts RFC 3339 strings and integer epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Reads the required `updated_at` field of a document.
pub fn updated_at(document: &Value) -> Result<DateTime<Utc>> {
    let raw = document
        .get("updated_at")
        .ok_or_else(|| StoreError::InvalidPayload("payload is missing 'updated_at'".into()))?;
    parse_timestamp(raw).ok_or_else(|| {
        StoreError::InvalidPayload(format!("'updated_at' is not a timestamp: {raw}"))
    })
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}
