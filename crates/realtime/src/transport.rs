// Transport abstraction: the push side of the persistence backend.
//
// A transport object is opened per channel. Subscribe progress, drops, and
// inbound events are reported through the `EventSink` handed to `open`, so
// implementations are free to complete the subscribe on their own schedule.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use pagesync_common::protocol::realtime::{BroadcastMessage, TransportEvent};

use crate::error::TransportError;

/// Logical channel identity: topic plus any equality filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn for_spec(spec: &ChannelSpec) -> Self {
        spec.key()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EqFilter {
    pub column: String,
    pub value: String,
}

/// What the transport should subscribe to for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub topic: String,
    /// Table whose row changes are delivered; `None` for presence/broadcast-only channels.
    pub table: Option<String>,
    pub filters: Vec<EqFilter>,
    /// Key this client tracks its own presence under.
    pub presence_key: Option<String>,
    /// Deliver our own broadcasts back to us.
    pub broadcast_self: bool,
}

impl ChannelSpec {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            table: None,
            filters: Vec::new(),
            presence_key: None,
            broadcast_self: false,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn filter_eq(mut self, column: impl Into<String>, value: impl fmt::Display) -> Self {
        self.filters.push(EqFilter { column: column.into(), value: value.to_string() });
        self
    }

    pub fn with_presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence_key = Some(key.into());
        self
    }

    pub fn with_broadcast_self(mut self, enabled: bool) -> Self {
        self.broadcast_self = enabled;
        self
    }

    /// Derive the logical key, e.g. `workspace:W:pages?parent_id=eq.P`.
    pub fn key(&self) -> ChannelKey {
        let mut key = self.topic.clone();
        if let Some(table) = &self.table {
            key.push(':');
            key.push_str(table);
        }
        let mut filters: Vec<String> =
            self.filters.iter().map(|f| format!("{}=eq.{}", f.column, f.value)).collect();
        filters.sort();
        if !filters.is_empty() {
            key.push('?');
            key.push_str(&filters.join("&"));
        }
        ChannelKey(key)
    }

    /// Whether a row of `table` passes this channel's table and equality filters.
    pub fn matches_row(&self, table: &str, row: &Value) -> bool {
        if self.table.as_deref() != Some(table) {
            return false;
        }
        self.filters.iter().all(|filter| match row.get(&filter.column) {
            Some(Value::String(s)) => *s == filter.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == filter.value,
        })
    }
}

/// Progress and traffic reported by a transport object.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Subscribed,
    /// The subscribe attempt did not complete.
    Failed(TransportError),
    /// An established subscription was lost.
    Dropped(TransportError),
    Event(TransportEvent),
}

pub type EventSink = Arc<dyn Fn(TransportSignal) + Send + Sync>;

/// One open transport subscription.
pub trait TransportChannel: Send + Sync {
    /// Fire-and-forget fan-out to the other clients on the topic.
    fn send_broadcast(&self, message: BroadcastMessage) -> Result<(), TransportError>;

    /// Publish (or replace) this client's presence meta under the channel's presence key.
    fn track(&self, meta: Value) -> Result<(), TransportError>;

    fn untrack(&self) -> Result<(), TransportError>;

    /// Idempotent.
    fn close(&self);
}

pub trait Transport: Send + Sync {
    /// Issue the transport subscribe for `spec`.
    fn open(
        &self,
        spec: &ChannelSpec,
        sink: EventSink,
    ) -> Result<Arc<dyn TransportChannel>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_encodes_topic_table_and_sorted_filters() {
        let spec = ChannelSpec::topic("workspace:w1")
            .with_table("pages")
            .filter_eq("workspace_id", "w1")
            .filter_eq("parent_id", "p9");
        assert_eq!(spec.key().as_str(), "workspace:w1:pages?parent_id=eq.p9&workspace_id=eq.w1");

        assert_eq!(ChannelSpec::topic("doc:p1").key().as_str(), "doc:p1");
    }

    #[test]
    fn different_filters_yield_different_keys() {
        let by_workspace = ChannelSpec::topic("t").with_table("pages").filter_eq("workspace_id", "w");
        let by_parent = ChannelSpec::topic("t").with_table("pages").filter_eq("parent_id", "p");
        assert_ne!(by_workspace.key(), by_parent.key());
    }

    #[test]
    fn matches_row_checks_table_and_filters() {
        let spec = ChannelSpec::topic("t").with_table("pages").filter_eq("parent_id", "p1");
        assert!(spec.matches_row("pages", &json!({ "parent_id": "p1", "title": "x" })));
        assert!(!spec.matches_row("pages", &json!({ "parent_id": "p2" })));
        assert!(!spec.matches_row("pages", &json!({ "parent_id": null })));
        assert!(!spec.matches_row("blocks", &json!({ "parent_id": "p1" })));

        let numeric = ChannelSpec::topic("t").with_table("blocks").filter_eq("position", 3);
        assert!(numeric.matches_row("blocks", &json!({ "position": 3 })));
    }
}
