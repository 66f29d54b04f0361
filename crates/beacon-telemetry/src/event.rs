//! Telemetry event data structures and wire serialization

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Maximum accepted event name length; longer names are truncated.
const EVENT_NAME_MAX_LEN: usize = 200;

/// Maximum number of properties kept per event.
const MAX_PROPERTIES: usize = 100;

/// Maximum length for string property values; longer strings are truncated.
const MAX_STRING_VALUE_LEN: usize = 4096;

/// Callback invoked with an event on drop or give-up.
pub type EventHook = Arc<dyn Fn(&Event) + Send + Sync>;

/// Pipeline stage of an event.
///
/// The durable store's row presence is authoritative for "pending"; this
/// field only mirrors the in-memory pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Sending,
    Sent,
}

/// One tracked occurrence, queued for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Opaque unique id; primary key in the offline store and the
    /// deduplication key for delete-after-send.
    pub id: String,
    pub name: String,
    pub properties: Map<String, Value>,
    /// Resolved once at creation time, never at send time.
    pub user_id: Option<String>,
    /// Milliseconds since epoch, strictly monotonic per process.
    pub timestamp: i64,
    /// Incremented each time a send attempt for this event fails; survives
    /// restarts for events held in the offline store.
    pub retry_count: u32,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create a new pending event. `name` and `properties` are expected to be
    /// sanitized already; `user_id` resolution happens in the client.
    pub fn new(name: String, properties: Map<String, Value>, user_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            properties,
            user_id,
            timestamp: next_timestamp(),
            retry_count: 0,
            status: EventStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Serialize to the ingestion wire format: the property bag merged with
    /// an `EventName` field and, exactly when present, a `UserId` field.
    pub fn to_wire(&self) -> Value {
        let mut body = self.properties.clone();
        body.insert(
            "EventName".to_string(),
            Value::String(self.name.clone()),
        );
        if let Some(user_id) = &self.user_id {
            body.insert("UserId".to_string(), Value::String(user_id.clone()));
        }
        Value::Object(body)
    }
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Millisecond timestamp, bumped past the previous one so that two events
/// created within the same millisecond still order deterministically.
fn next_timestamp() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// Sanitize an event name.
///
/// Trims whitespace, strips control characters, truncates to
/// `EVENT_NAME_MAX_LEN`, and substitutes `"unnamed_event"` for an empty
/// result. The diagnostic describes what changed; a non-empty diagnostic
/// means "proceed with the sanitized value", never "drop the event".
pub fn sanitize_event_name(name: &str) -> (String, Option<String>) {
    let mut diagnostics = Vec::new();

    let mut cleaned: String = name.trim().chars().filter(|c| !c.is_control()).collect();
    if cleaned.len() != name.len() {
        diagnostics.push("removed surrounding whitespace or control characters".to_string());
    }

    if cleaned.chars().count() > EVENT_NAME_MAX_LEN {
        cleaned = cleaned.chars().take(EVENT_NAME_MAX_LEN).collect();
        diagnostics.push(format!("truncated name to {EVENT_NAME_MAX_LEN} chars"));
    }

    if cleaned.is_empty() {
        cleaned = "unnamed_event".to_string();
        diagnostics.push("empty name replaced with 'unnamed_event'".to_string());
    }

    let diagnostic = if diagnostics.is_empty() {
        None
    } else {
        Some(diagnostics.join("; "))
    };
    (cleaned, diagnostic)
}

/// Sanitize an event property bag.
///
/// Caps the entry count at `MAX_PROPERTIES` and truncates string values
/// (including nested ones) to `MAX_STRING_VALUE_LEN`. Events are never
/// dropped here; oversized input is reduced and reported.
pub fn sanitize_properties(properties: Map<String, Value>) -> (Map<String, Value>, Option<String>) {
    let mut diagnostics = Vec::new();

    let total = properties.len();
    let mut truncated_strings = 0usize;
    let mut kept = Map::new();
    for (key, value) in properties.into_iter().take(MAX_PROPERTIES) {
        kept.insert(key, truncate_strings(value, &mut truncated_strings));
    }

    if total > MAX_PROPERTIES {
        diagnostics.push(format!(
            "dropped {} properties over the {MAX_PROPERTIES}-entry cap",
            total - MAX_PROPERTIES
        ));
    }
    if truncated_strings > 0 {
        diagnostics.push(format!(
            "truncated {truncated_strings} string values to {MAX_STRING_VALUE_LEN} chars"
        ));
    }

    let diagnostic = if diagnostics.is_empty() {
        None
    } else {
        Some(diagnostics.join("; "))
    };
    (kept, diagnostic)
}

fn truncate_strings(value: Value, truncated: &mut usize) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_STRING_VALUE_LEN => {
            *truncated += 1;
            Value::String(s.chars().take(MAX_STRING_VALUE_LEN).collect())
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| truncate_strings(item, truncated))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, truncate_strings(v, truncated)))
                .collect(),
        ),
        other => other,
    }
}
