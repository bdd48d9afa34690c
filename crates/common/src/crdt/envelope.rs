use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broadcast event name used for CRDT deltas unless configured otherwise.
pub const DEFAULT_DELTA_EVENT: &str = "crdt-delta";

/// Identifies one editable text field: `<record id>/<field name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn for_field(record_id: impl fmt::Display, field: &str) -> Self {
        Self(format!("{record_id}/{field}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One CRDT delta relayed between replicas over a broadcast channel.
///
/// `delta` is the v1-encoded binary update in standard base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEnvelope {
    pub doc_id: DocId,
    pub sender_id: String,
    pub delta: String,
    /// The sender's state vector before the edit, v1-encoded in base64.
    /// Receivers hold the delta until they have caught up to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for DeltaEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({} b64 bytes, {})",
            self.sender_id,
            self.doc_id,
            self.delta.len(),
            self.timestamp.to_rfc3339()
        )
    }
}
