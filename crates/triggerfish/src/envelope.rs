//! Notification envelope
//!
//! The generated notify function publishes one JSON object per row change:
//!
//! ```json
//! {"operation":"UPDATE","timestamp":"2024-05-01T10:00:00.000000Z",
//!  "schema":"public","table":"orders","data":{"id":1,"status":"paid"}}
//! ```
//!
//! `data` is the before-image for DELETE, the after-image for INSERT and
//! UPDATE, and an empty object for TRUNCATE. Parsing is strict: unknown keys,
//! missing keys, or a non-object `data` are rejected.

use crate::error::{Error, Result};
use crate::transport::RawNotification;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use triggerfish_sql::condition::Row;
use triggerfish_sql::trigger::TriggerOperation;
use uuid::Uuid;

/// One row change as published by a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    /// Operation that fired the trigger (`TG_OP`)
    pub operation: TriggerOperation,
    /// When the notify function ran
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Table schema
    pub schema: String,
    /// Table name
    pub table: String,
    /// Row image
    pub data: Row,
}

impl Envelope {
    /// Parse a raw payload received on `channel`
    pub fn parse(channel: &str, payload: &str) -> Result<Self> {
        Self::from_json(payload).map_err(|e| Error::PayloadParse {
            channel: channel.to_string(),
            message: e.to_string(),
        })
    }

    /// Parse a payload without channel context
    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// Whether `data` holds the row as it was before the change
    pub fn is_before_image(&self) -> bool {
        self.operation == TriggerOperation::Delete
    }

    /// Deserialize the row image
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.data.clone()))
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_timestamp(&text).ok_or_else(|| {
        serde::de::Error::custom(format!("invalid timestamp '{}'", text))
    })
}

/// RFC 3339, or PostgreSQL's text output for `timestamptz`
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// A parsed notification, shared by every handler on its channel
#[derive(Debug, Clone)]
pub struct Notification {
    /// Unique id of this delivery
    pub delivery_id: Uuid,
    /// Channel the payload arrived on
    pub channel: String,
    /// Parsed envelope
    pub envelope: Envelope,
    /// Payload exactly as received
    pub raw: Arc<str>,
    /// Backend process that sent the notification
    pub process_id: i32,
    /// When the payload was received
    pub received_at: DateTime<Utc>,
}

impl Notification {
    /// Parse a raw transport notification
    pub fn from_raw(raw: RawNotification) -> Result<Self> {
        let envelope = Envelope::parse(&raw.channel, &raw.payload)?;
        Ok(Self::new(raw, envelope))
    }

    /// Pair a raw notification with its already parsed envelope
    pub fn new(raw: RawNotification, envelope: Envelope) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            channel: raw.channel,
            envelope,
            raw: Arc::from(raw.payload),
            process_id: raw.process_id,
            received_at: Utc::now(),
        }
    }

    /// Operation that fired the trigger
    pub fn operation(&self) -> TriggerOperation {
        self.envelope.operation
    }

    /// Row image
    pub fn data(&self) -> &Row {
        &self.envelope.data
    }

    /// Deserialize the row image
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        self.envelope.decode()
    }
}
