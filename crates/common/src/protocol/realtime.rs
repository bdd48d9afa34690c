// Inbound event types for the realtime transport (row changes, presence, broadcast).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of row mutation reported by the change feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowEventType {
    Insert,
    Update,
    Delete,
}

impl RowEventType {
    pub const ALL: [RowEventType; 3] = [Self::Insert, Self::Update, Self::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for RowEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown row event type `{other}`")),
        }
    }
}

/// A raw row change as delivered by the change feed, before schema validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowEvent {
    pub table: String,
    pub event_type: RowEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    pub commit_timestamp: DateTime<Utc>,
}

/// Presence traffic for one topic. Metas are raw peer states keyed by presence key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Full snapshot of everyone currently tracked on the topic.
    Sync { state: BTreeMap<String, Vec<Value>> },
    Join { key: String, new_presences: Vec<Value> },
    Leave { key: String, left_presences: Vec<Value> },
}

/// Arbitrary fire-and-forget payload fanned out to other clients on a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: Value,
}

/// Everything a transport channel can push to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TransportEvent {
    RowChange(RowEvent),
    Presence(PresenceEvent),
    Broadcast(BroadcastMessage),
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RowChange(_) => "row_change",
            Self::Presence(_) => "presence",
            Self::Broadcast(_) => "broadcast",
        }
    }
}
