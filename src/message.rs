// src/message.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type discriminant of the session-establishment control frame. It is the
/// first frame of every session and carries the server-issued connection id.
pub const CONNECTED_KIND: &str = "connected";

/// One frame of the live stream.
///
/// The wire shape is `{"type", "sequenceNumber", "timestamp", ...payload}`
/// with every field beyond the envelope flattened into `payload`. Sequence
/// numbers are assigned by the server and strictly increase within one
/// connection session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Message {
    /// Parse a text frame off the wire.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_connected_frame(&self) -> bool {
        self.kind == CONNECTED_KIND
    }

    /// The server-issued connection id, present on `connected` frames only.
    pub fn connection_id(&self) -> Option<&str> {
        self.payload.get("connectionId").and_then(Value::as_str)
    }
}
