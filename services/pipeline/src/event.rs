//! Lifecycle events emitted by the object store.
//!
//! Events arrive either already in the pipeline's JSON shape or as object store
//! notifications, optionally wrapped in a topic envelope by the fanout layer.
//! [`decode_notification`] accepts all three shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while decoding inbound events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    #[error("Unsupported event name: {0}")]
    UnsupportedEventName(String),

    #[error("Invalid object key encoding: {0}")]
    InvalidKey(String),
}

/// Kind of object lifecycle change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// An object was written
    Created,
    /// An object was deleted
    Removed,
}

/// Notification that an object was created or removed, carrying its size
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Event identity, stable across redeliveries
    pub event_id: Uuid,
    /// Store (bucket) the object lives in
    pub store_id: String,
    /// Object key within the store
    pub object_key: String,
    /// Created or removed
    pub event_type: EventType,
    /// Object size in bytes
    pub size_bytes: u64,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Create a new event stamped with a fresh id and the current time
    pub fn new(
        store_id: impl Into<String>,
        object_key: impl Into<String>,
        event_type: EventType,
        size_bytes: u64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            store_id: store_id.into(),
            object_key: object_key.into(),
            event_type,
            size_bytes,
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for a CREATED event
    pub fn created(store_id: impl Into<String>, object_key: impl Into<String>, size: u64) -> Self {
        Self::new(store_id, object_key, EventType::Created, size)
    }

    /// Shorthand for a REMOVED event
    pub fn removed(store_id: impl Into<String>, object_key: impl Into<String>, size: u64) -> Self {
        Self::new(store_id, object_key, EventType::Removed, size)
    }

    /// Override the event timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Signed byte change this event applies to its store
    pub fn size_delta(&self) -> i64 {
        let size = i64::try_from(self.size_bytes).unwrap_or(i64::MAX);
        match self.event_type {
            EventType::Created => size,
            EventType::Removed => -size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TopicEnvelope {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StoreNotification {
    #[serde(rename = "Records", default)]
    records: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NotificationRecord {
    #[serde(rename = "eventName")]
    event_name: String,
    #[serde(rename = "eventTime")]
    event_time: Option<DateTime<Utc>>,
    s3: NotificationEntity,
}

#[derive(Debug, Deserialize)]
struct NotificationEntity {
    bucket: NotificationBucket,
    object: NotificationObject,
}

#[derive(Debug, Deserialize)]
struct NotificationBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NotificationObject {
    key: String,
    size: Option<u64>,
    sequencer: Option<String>,
}

/// Decode an inbound payload into lifecycle events.
///
/// Accepts a pipeline [`LifecycleEvent`], a raw store notification
/// (`{"Records": [...]}`), or a notification wrapped in a topic envelope
/// (`{"Message": "<notification json>"}`). Removal notifications carry no size,
/// so their `size_bytes` is 0 and must be resolved downstream. Object keys
/// arrive URL-encoded and are decoded here.
pub fn decode_notification(payload: &[u8]) -> Result<Vec<LifecycleEvent>, EventError> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| EventError::DeserializationError(e.to_string()))?;

    if value.get("Message").is_some() {
        let envelope: TopicEnvelope = serde_json::from_value(value)
            .map_err(|e| EventError::DeserializationError(e.to_string()))?;
        return decode_notification(envelope.message.as_bytes());
    }

    if value.get("Records").is_some() {
        let notification: StoreNotification = serde_json::from_value(value)
            .map_err(|e| EventError::DeserializationError(e.to_string()))?;
        return notification
            .records
            .into_iter()
            .map(|raw| {
                let record: NotificationRecord = serde_json::from_value(raw.clone())
                    .map_err(|e| EventError::DeserializationError(e.to_string()))?;
                convert_record(record, &raw)
            })
            .collect();
    }

    let event: LifecycleEvent = serde_json::from_value(value)
        .map_err(|e| EventError::DeserializationError(e.to_string()))?;
    Ok(vec![event])
}

/// Notification keys use form encoding: `+` is a space
fn decode_key(raw: &str) -> Result<String, EventError> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|key| key.into_owned())
        .map_err(|e| EventError::InvalidKey(format!("{raw}: {e}")))
}

fn convert_record(
    record: NotificationRecord,
    raw: &serde_json::Value,
) -> Result<LifecycleEvent, EventError> {
    let event_type = if record.event_name.starts_with("ObjectCreated") {
        EventType::Created
    } else if record.event_name.starts_with("ObjectRemoved") {
        EventType::Removed
    } else {
        return Err(EventError::UnsupportedEventName(record.event_name));
    };

    // Same notification redelivered must map to the same id
    let version = record
        .s3
        .object
        .sequencer
        .clone()
        .or_else(|| record.event_time.map(|t| t.to_rfc3339()));
    let identity = match version {
        Some(version) => format!(
            "{}/{}#{}:{}",
            record.s3.bucket.name, record.s3.object.key, version, record.event_name
        ),
        // Equal records serialize to equal text
        None => raw.to_string(),
    };

    Ok(LifecycleEvent {
        event_id: Uuid::new_v5(&Uuid::NAMESPACE_URL, identity.as_bytes()),
        object_key: decode_key(&record.s3.object.key)?,
        store_id: record.s3.bucket.name,
        event_type,
        size_bytes: record.s3.object.size.unwrap_or(0),
        timestamp: record.event_time.unwrap_or_else(Utc::now),
    })
}
