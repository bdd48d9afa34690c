// Ephemeral per-peer presence state carried over presence channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::RecordId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    #[default]
    Human,
    Agent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    pub line: u32,
    pub ch: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionRange {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

/// What a peer publishes about itself when it tracks presence.
///
/// Unknown fields are ignored so that older clients keep working.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceMeta {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub kind: PresenceKind,
    /// Hex color assigned to this peer (e.g. "#e06c75").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Record the peer currently has open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_record: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_at: Option<DateTime<Utc>>,
}

impl PresenceMeta {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            kind: PresenceKind::Human,
            color: None,
            active_record: None,
            cursor: None,
            selection: None,
            online_at: None,
        }
    }

    /// Returns `None` when the value lacks the required `user_id`.
    pub fn from_json(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// All metas published under one presence key (one key may have several tabs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePeer {
    pub key: String,
    pub metas: Vec<PresenceMeta>,
}
