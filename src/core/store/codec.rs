//! JSON column and timestamp codecs shared by both dialects.
//!
//! The embedded dialect stores JSON as text and timestamps as strings; the
//! server dialect stores JSONB and native timestamps. Both go through the
//! same nil-handling rules: a missing list encodes as `[]`, a missing map as
//! `{}`, and a missing nullable object as SQL NULL.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::error::{Error, Result};

pub const EMPTY_LIST: &str = "[]";
pub const EMPTY_MAP: &str = "{}";

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

fn decode_err(column: &str, err: serde_json::Error) -> Error {
    Error::internal(format!("column {} holds malformed JSON", column)).with_source(err)
}

pub fn encode_list<T: Serialize>(items: Option<&[T]>) -> Result<String> {
    match items {
        Some(items) => Ok(serde_json::to_string(items)?),
        None => Ok(EMPTY_LIST.to_string()),
    }
}

pub fn list_value<T: Serialize>(items: Option<&[T]>) -> Result<Value> {
    match items {
        Some(items) => Ok(serde_json::to_value(items)?),
        None => Ok(Value::Array(Vec::new())),
    }
}

pub fn decode_list<T: DeserializeOwned>(column: &str, raw: Option<&[u8]>) -> Result<Vec<T>> {
    match raw {
        None => Ok(Vec::new()),
        Some(bytes) if is_blank(bytes) => Ok(Vec::new()),
        Some(bytes) => {
            let value: Value = serde_json::from_slice(bytes).map_err(|e| decode_err(column, e))?;
            decode_list_value(column, Some(value))
        }
    }
}

pub fn decode_list_value<T: DeserializeOwned>(column: &str, value: Option<Value>) -> Result<Vec<T>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v).map_err(|e| decode_err(column, e)),
    }
}

pub type JsonMap = serde_json::Map<String, Value>;

pub fn encode_map(map: Option<&JsonMap>) -> Result<String> {
    match map {
        Some(map) => Ok(serde_json::to_string(map)?),
        None => Ok(EMPTY_MAP.to_string()),
    }
}

pub fn map_value(map: Option<&JsonMap>) -> Value {
    Value::Object(map.cloned().unwrap_or_default())
}

pub fn decode_map(column: &str, raw: Option<&[u8]>) -> Result<JsonMap> {
    match raw {
        None => Ok(JsonMap::new()),
        Some(bytes) if is_blank(bytes) => Ok(JsonMap::new()),
        Some(bytes) => {
            let value: Value = serde_json::from_slice(bytes).map_err(|e| decode_err(column, e))?;
            decode_map_value(column, Some(value))
        }
    }
}

pub fn decode_map_value(column: &str, value: Option<Value>) -> Result<JsonMap> {
    match value {
        None | Some(Value::Null) => Ok(JsonMap::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(Error::internal(format!(
            "column {} expected a JSON object, found {}",
            column,
            json_kind(&other)
        ))),
    }
}

/// Nullable object: `None` stays SQL NULL.
pub fn encode_object<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Error::from)
}

pub fn object_value<T: Serialize>(value: Option<&T>) -> Result<Option<Value>> {
    value.map(serde_json::to_value).transpose().map_err(Error::from)
}

pub fn decode_object<T: DeserializeOwned>(column: &str, raw: Option<&[u8]>) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(bytes) if is_blank(bytes) => Ok(None),
        Some(bytes) => {
            let value: Value = serde_json::from_slice(bytes).map_err(|e| decode_err(column, e))?;
            decode_object_value(column, Some(value))
        }
    }
}

pub fn decode_object_value<T: DeserializeOwned>(
    column: &str,
    value: Option<Value>,
) -> Result<Option<T>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| decode_err(column, e)),
    }
}

/// Arbitrary JSON (event payloads, checkpoint snapshots). NULL decodes as `{}`.
pub fn decode_value(column: &str, raw: Option<&[u8]>) -> Result<Value> {
    match raw {
        None => Ok(Value::Object(JsonMap::new())),
        Some(bytes) if is_blank(bytes) => Ok(Value::Object(JsonMap::new())),
        Some(bytes) => serde_json::from_slice(bytes).map_err(|e| decode_err(column, e)),
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b.is_ascii_whitespace()) || bytes == b"null"
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// ISO-8601 UTC with nanoseconds, e.g. `2024-05-01T10:00:00.123456789Z`.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn encode_opt_ts(ts: Option<&DateTime<Utc>>) -> Option<String> {
    ts.map(encode_ts)
}

/// Accepts RFC 3339 with any offset, plus the naive layouts SQLite's own
/// `CURRENT_TIMESTAMP` and older rows use (interpreted as UTC).
pub fn decode_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let trimmed = raw.strip_suffix('Z').unwrap_or(raw);
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(Error::internal(format!(
        "column {} holds an unrecognised timestamp",
        column
    )))
}

pub fn decode_opt_ts(column: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| decode_ts(column, s))
        .transpose()
}
