// Change notification router.
//
// Classifies inbound transport events and fans them out to the subscriptions
// registered on one channel. Delivery iterates over a snapshot of the
// subscription arena, so callbacks may subscribe or unsubscribe re-entrantly.
// A panicking callback is logged and does not stop delivery to the others.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, warn};

use pagesync_common::presence::{PresenceMeta, PresencePeer};
use pagesync_common::protocol::realtime::{PresenceEvent, RowEvent, RowEventType, TransportEvent};
use pagesync_common::types::{record_id_of, PayloadError, Record, RecordId};

use crate::connection::ConnectionState;
use crate::lock;

/// Opaque handle of one subscription; unique across all channels of a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// A row change after validation against the table schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table: String,
    pub event_type: RowEventType,
    pub new: Option<Record>,
    /// Full previous row, when the feed sent one.
    pub old: Option<Record>,
    /// Primary key of the previous row; delete events often carry nothing else.
    pub old_id: Option<RecordId>,
    pub commit_timestamp: DateTime<Utc>,
}

impl RowChange {
    pub fn from_event(event: &RowEvent) -> Result<Self, PayloadError> {
        let new = event.new.as_ref().map(|value| Record::decode(&event.table, value)).transpose()?;
        let old = event.old.as_ref().and_then(|value| Record::decode(&event.table, value).ok());
        let old_id = event.old.as_ref().and_then(record_id_of);
        Ok(Self {
            table: event.table.clone(),
            event_type: event.event_type,
            new,
            old,
            old_id,
            commit_timestamp: event.commit_timestamp,
        })
    }

    /// Id of the affected record.
    pub fn record_id(&self) -> Option<&RecordId> {
        self.new.as_ref().map(Record::id).or(self.old_id.as_ref())
    }
}

pub type ChangeCallback = Arc<dyn Fn(&RowChange) + Send + Sync>;
pub type SyncCallback = Arc<dyn Fn(&[PresencePeer]) + Send + Sync>;
pub type PeerCallback = Arc<dyn Fn(&str, &[PresenceMeta]) + Send + Sync>;
pub type BroadcastCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Which row changes a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    events: BTreeSet<RowEventType>,
    table: Option<String>,
}

impl ChangeFilter {
    pub fn all() -> Self {
        Self { events: RowEventType::ALL.into_iter().collect(), table: None }
    }

    pub fn only(events: &[RowEventType]) -> Self {
        Self { events: events.iter().copied().collect(), table: None }
    }

    pub fn for_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        self.events.contains(&change.event_type)
            && self.table.as_deref().map_or(true, |table| table == change.table)
    }
}

impl Default for ChangeFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Per-event-type callbacks for a row-change subscription.
#[derive(Clone, Default)]
pub struct ChangeHandlers {
    on_insert: Option<ChangeCallback>,
    on_update: Option<ChangeCallback>,
    on_delete: Option<ChangeCallback>,
}

impl ChangeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// One callback for every event type.
    pub fn on_any(callback: impl Fn(&RowChange) + Send + Sync + 'static) -> Self {
        let callback: ChangeCallback = Arc::new(callback);
        Self {
            on_insert: Some(Arc::clone(&callback)),
            on_update: Some(Arc::clone(&callback)),
            on_delete: Some(callback),
        }
    }

    pub fn on_insert(mut self, callback: impl Fn(&RowChange) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Arc::new(callback));
        self
    }

    pub fn on_update(mut self, callback: impl Fn(&RowChange) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(callback));
        self
    }

    pub fn on_delete(mut self, callback: impl Fn(&RowChange) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Arc::new(callback));
        self
    }

    fn callback_for(&self, event_type: RowEventType) -> Option<&ChangeCallback> {
        match event_type {
            RowEventType::Insert => self.on_insert.as_ref(),
            RowEventType::Update => self.on_update.as_ref(),
            RowEventType::Delete => self.on_delete.as_ref(),
        }
    }
}

#[derive(Clone, Default)]
pub struct PresenceHandlers {
    on_sync: Option<SyncCallback>,
    on_join: Option<PeerCallback>,
    on_leave: Option<PeerCallback>,
}

impl PresenceHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sync(mut self, callback: impl Fn(&[PresencePeer]) + Send + Sync + 'static) -> Self {
        self.on_sync = Some(Arc::new(callback));
        self
    }

    pub fn on_join(
        mut self,
        callback: impl Fn(&str, &[PresenceMeta]) + Send + Sync + 'static,
    ) -> Self {
        self.on_join = Some(Arc::new(callback));
        self
    }

    pub fn on_leave(
        mut self,
        callback: impl Fn(&str, &[PresenceMeta]) + Send + Sync + 'static,
    ) -> Self {
        self.on_leave = Some(Arc::new(callback));
        self
    }
}

#[derive(Clone)]
pub(crate) enum Handler {
    Changes { filter: ChangeFilter, handlers: ChangeHandlers },
    Presence(PresenceHandlers),
    Broadcast { event: String, callback: BroadcastCallback },
    Status(StatusCallback),
}

/// Subscription arena for one channel.
pub struct EventRouter {
    label: String,
    handlers: Mutex<BTreeMap<SubscriptionId, Handler>>,
}

impl EventRouter {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), handlers: Mutex::new(BTreeMap::new()) }
    }

    pub(crate) fn insert(&self, id: SubscriptionId, handler: Handler) {
        lock(&self.handlers).insert(id, handler);
    }

    /// Returns false if the handle was already gone.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        lock(&self.handlers).remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.handlers).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.handlers).clear();
    }

    /// Deliver one inbound event. Returns how many callbacks were invoked.
    pub fn dispatch(&self, event: &TransportEvent) -> usize {
        match event {
            TransportEvent::RowChange(raw) => self.dispatch_row(raw),
            TransportEvent::Presence(presence) => self.dispatch_presence(presence),
            TransportEvent::Broadcast(message) => {
                let targets: Vec<BroadcastCallback> = self.snapshot(|handler| match handler {
                    Handler::Broadcast { event, callback } if *event == message.event => {
                        Some(Arc::clone(callback))
                    }
                    _ => None,
                });
                for callback in &targets {
                    self.invoke("broadcast", || callback(&message.payload));
                }
                targets.len()
            }
        }
    }

    /// Tell status subscribers about a connection state transition.
    pub fn notify_status(&self, state: ConnectionState) -> usize {
        let targets: Vec<StatusCallback> = self.snapshot(|handler| match handler {
            Handler::Status(callback) => Some(Arc::clone(callback)),
            _ => None,
        });
        for callback in &targets {
            self.invoke("status", || callback(state));
        }
        targets.len()
    }

    fn dispatch_row(&self, raw: &RowEvent) -> usize {
        let change = match RowChange::from_event(raw) {
            Ok(change) => change,
            Err(error) => {
                warn!(channel = %self.label, table = %raw.table, %error, "dropping malformed row change");
                return 0;
            }
        };

        let targets: Vec<ChangeCallback> = self.snapshot(|handler| match handler {
            Handler::Changes { filter, handlers } if filter.matches(&change) => {
                handlers.callback_for(change.event_type).cloned()
            }
            _ => None,
        });
        for callback in &targets {
            self.invoke("row_change", || callback(&change));
        }
        targets.len()
    }

    fn dispatch_presence(&self, event: &PresenceEvent) -> usize {
        let targets: Vec<PresenceHandlers> = self.snapshot(|handler| match handler {
            Handler::Presence(handlers) => Some(handlers.clone()),
            _ => None,
        });

        let mut invoked = 0;
        match event {
            PresenceEvent::Sync { state } => {
                let peers: Vec<PresencePeer> = state
                    .iter()
                    .map(|(key, metas)| PresencePeer { key: key.clone(), metas: self.decode_metas(metas) })
                    .collect();
                for callback in targets.iter().filter_map(|h| h.on_sync.as_ref()) {
                    self.invoke("presence_sync", || callback(&peers));
                    invoked += 1;
                }
            }
            PresenceEvent::Join { key, new_presences } => {
                let metas = self.decode_metas(new_presences);
                for callback in targets.iter().filter_map(|h| h.on_join.as_ref()) {
                    self.invoke("presence_join", || callback(key, &metas));
                    invoked += 1;
                }
            }
            PresenceEvent::Leave { key, left_presences } => {
                let metas = self.decode_metas(left_presences);
                for callback in targets.iter().filter_map(|h| h.on_leave.as_ref()) {
                    self.invoke("presence_leave", || callback(key, &metas));
                    invoked += 1;
                }
            }
        }
        invoked
    }

    fn decode_metas(&self, raw: &[Value]) -> Vec<PresenceMeta> {
        raw.iter()
            .filter_map(|value| {
                let meta = PresenceMeta::from_json(value);
                if meta.is_none() {
                    warn!(channel = %self.label, "dropping malformed presence meta");
                }
                meta
            })
            .collect()
    }

    fn snapshot<T>(&self, select: impl Fn(&Handler) -> Option<T>) -> Vec<T> {
        lock(&self.handlers).values().filter_map(select).collect()
    }

    fn invoke(&self, kind: &str, callback: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
            error!(
                channel = %self.label,
                kind,
                panic = panic_message(panic.as_ref()),
                "subscriber callback panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
