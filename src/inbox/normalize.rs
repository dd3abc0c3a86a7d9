//! Normalization of server payloads into [`NotificationRecord`]s.
//!
//! The backend has shipped several listing shapes over time:
//!
//! ```text
//! [ {...}, ... ]
//! { "notifications": [ ... ] }
//! { "data": [ ... ] }
//! { "data": { "notifications": [ ... ] } }
//! ```
//!
//! and several field spellings per record. Everything here is total: a
//! payload that cannot be understood yields an empty list or an absent
//! count and a logged [`ApiError::MalformedPayload`], never an error.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::model::{dedup_by_id, NotificationRecord, Priority};
use crate::error::ApiError;

const SYNTHETIC_ID_PREFIX: &str = "synthetic-";

/// Extracts the notification list from a listing response.
pub fn normalize_list(payload: &Value) -> Vec<NotificationRecord> {
    let Some(items) = list_items(payload) else {
        log::warn!(
            "[Inbox] {}",
            ApiError::MalformedPayload("unrecognized notification listing".to_string())
        );
        return Vec::new();
    };

    let received_at = Utc::now();
    let mut records: Vec<_> = items
        .iter()
        .filter_map(|item| {
            let record = normalize_record(item, received_at);
            if record.is_none() {
                log::debug!("[Inbox] Skipping non-object listing entry");
            }
            record
        })
        .collect();
    dedup_by_id(&mut records);
    records
}

fn list_items(payload: &Value) -> Option<&Vec<Value>> {
    if let Some(items) = payload.as_array() {
        return Some(items);
    }
    if let Some(items) = payload.get("notifications").and_then(Value::as_array) {
        return Some(items);
    }
    let data = payload.get("data")?;
    data.as_array()
        .or_else(|| data.get("notifications").and_then(Value::as_array))
}

/// Extracts the unread count from a count response.
///
/// Accepts a bare number, `{count}`, `{unreadCount}` or `{data: {count}}`.
pub fn normalize_count(payload: &Value) -> Option<u64> {
    let candidate = if payload.is_object() {
        payload
            .get("count")
            .or_else(|| payload.get("unreadCount"))
            .or_else(|| payload.get("data").and_then(|data| data.get("count")))
    } else {
        Some(payload)
    };

    let count = candidate.and_then(as_count);
    if count.is_none() {
        log::warn!(
            "[Inbox] {}",
            ApiError::MalformedPayload(format!("unrecognized unread count: {payload}"))
        );
    }
    count
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v.max(0).unsigned_abs()))
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Normalizes a single record. Returns `None` for non-object payloads.
///
/// Missing fields take defaults: priority `NORMAL`, unread, not delivered
/// via the stream, empty title and body, and `received_at` as creation
/// time. A missing id is replaced by a deterministic synthesized one.
pub fn normalize_record(payload: &Value, received_at: DateTime<Utc>) -> Option<NotificationRecord> {
    let fields = payload.as_object()?;

    let title = first_of(fields, &["title"]).map(text).unwrap_or_default();
    let body = first_of(fields, &["body", "message"]).map(text).unwrap_or_default();
    let raw_created = first_of(fields, &["createdAt", "created_at"]);
    let raw_priority = first_of(fields, &["priority"]);

    let id = match first_of(fields, &["id", "_id"]) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => synthesize_id(&title, &body, raw_created, raw_priority),
    };

    Some(NotificationRecord {
        id,
        title,
        body,
        is_read: first_of(fields, &["isRead", "is_read", "read"])
            .and_then(as_flag)
            .unwrap_or(false),
        priority: raw_priority
            .and_then(Value::as_str)
            .and_then(Priority::parse)
            .unwrap_or_default(),
        delivered_via_stream: first_of(
            fields,
            &["deliveredViaStream", "deliveredViaSSE", "delivered_via_sse"],
        )
        .and_then(as_flag)
        .unwrap_or(false),
        created_at: raw_created.and_then(timestamp).unwrap_or(received_at),
        expires_at: first_of(fields, &["expiresAt", "expires_at"]).and_then(timestamp),
    })
}

fn first_of<'a>(fields: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| fields.get(*name))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parses RFC 3339 strings or epoch milliseconds.
fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Stable id for records the server sent without one.
///
/// Hashes the fields exactly as they appear in the payload, so the same
/// payload always maps to the same id regardless of when it arrived.
fn synthesize_id(
    title: &str,
    body: &str,
    created: Option<&Value>,
    priority: Option<&Value>,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        title.to_string(),
        body.to_string(),
        created.map(text).unwrap_or_default(),
        priority.map(text).unwrap_or_default(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();

    let mut id = String::with_capacity(SYNTHETIC_ID_PREFIX.len() + 16);
    id.push_str(SYNTHETIC_ID_PREFIX);
    for byte in &digest[..8] {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}
