// In-process persistence backend shared by any number of clients.
//
// Holds row tables, fans row changes out to channels whose table and filters
// match, keeps per-topic presence, and relays broadcasts. Deliveries are
// collected under the state lock and dispatched after it is released, so a
// sink may call straight back into the backend.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, trace};

use pagesync_common::protocol::realtime::{
    BroadcastMessage, PresenceEvent, RowEvent, RowEventType, TransportEvent,
};
use pagesync_common::types::{Record, RecordId};

use crate::error::{RemoteError, TransportError};
use crate::lock;
use crate::optimistic::{Entity, RemoteStore};
use crate::scheduler::Scheduler;
use crate::transport::{ChannelSpec, EventSink, Transport, TransportChannel, TransportSignal};

type Deliveries = Vec<(EventSink, TransportSignal)>;

fn dispatch(deliveries: Deliveries) {
    for (sink, signal) in deliveries {
        sink(signal);
    }
}

struct OpenChannel {
    spec: ChannelSpec,
    sink: EventSink,
    closed: Arc<AtomicBool>,
}

struct State {
    accepting: bool,
    echo_client_ref: bool,
    remote_delay: Duration,
    remote_failures: VecDeque<RemoteError>,
    tables: BTreeMap<String, BTreeMap<RecordId, Value>>,
    channels: BTreeMap<u64, OpenChannel>,
    /// topic → presence key → (channel, meta)
    presence: HashMap<String, BTreeMap<String, Vec<(u64, Value)>>>,
    opens: HashMap<String, u64>,
    closes: HashMap<String, u64>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            accepting: true,
            echo_client_ref: true,
            remote_delay: Duration::ZERO,
            remote_failures: VecDeque::new(),
            tables: BTreeMap::new(),
            channels: BTreeMap::new(),
            presence: HashMap::new(),
            opens: HashMap::new(),
            closes: HashMap::new(),
        }
    }
}

impl State {
    fn on_topic<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = (u64, &'a OpenChannel)> + 'a {
        self.channels
            .iter()
            .filter(move |(_, channel)| channel.spec.topic == topic)
            .map(|(id, channel)| (*id, channel))
    }

    fn presence_snapshot(&self, topic: &str) -> BTreeMap<String, Vec<Value>> {
        self.presence
            .get(topic)
            .map(|keys| {
                keys.iter()
                    .filter(|(_, metas)| !metas.is_empty())
                    .map(|(key, metas)| (key.clone(), metas.iter().map(|(_, meta)| meta.clone()).collect()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `event` followed by a fresh snapshot, for every channel on `topic`.
    fn presence_fanout(&self, topic: &str, event: PresenceEvent) -> Deliveries {
        let sync = PresenceEvent::Sync { state: self.presence_snapshot(topic) };
        let mut deliveries = Vec::new();
        for (_, channel) in self.on_topic(topic) {
            for event in [event.clone(), sync.clone()] {
                deliveries.push((
                    Arc::clone(&channel.sink),
                    TransportSignal::Event(TransportEvent::Presence(event)),
                ));
            }
        }
        deliveries
    }

    /// Drop everything `channel` tracked on `topic`; returns the key and metas it held.
    fn remove_presence(&mut self, topic: &str, channel: u64) -> Option<(String, Vec<Value>)> {
        let keys = self.presence.get_mut(topic)?;
        let mut left = None;
        for (key, metas) in keys.iter_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = metas.drain(..).partition(|(id, _)| *id == channel);
            *metas = kept;
            if !gone.is_empty() {
                left = Some((key.clone(), gone.into_iter().map(|(_, meta)| meta).collect()));
            }
        }
        keys.retain(|_, metas| !metas.is_empty());
        left
    }

    /// Store (or delete) a row and build the change event for matching channels.
    fn write(
        &mut self,
        table: &str,
        id: &RecordId,
        new: Option<Value>,
        at: DateTime<Utc>,
    ) -> Deliveries {
        let rows = self.tables.entry(table.to_string()).or_default();
        let old = match &new {
            Some(row) => rows.insert(id.clone(), row.clone()),
            None => rows.remove(id),
        };
        let event_type = match (&old, &new) {
            (None, Some(_)) => RowEventType::Insert,
            (Some(_), Some(_)) => RowEventType::Update,
            (Some(_), None) => RowEventType::Delete,
            (None, None) => return Vec::new(),
        };
        let event = RowEvent { table: table.to_string(), event_type, new, old, commit_timestamp: at };
        trace!(%table, id = %id, %event_type, "row committed");

        self.channels
            .values()
            .filter(|channel| {
                [event.new.as_ref(), event.old.as_ref()]
                    .into_iter()
                    .flatten()
                    .any(|row| channel.spec.matches_row(table, row))
            })
            .map(|channel| {
                (Arc::clone(&channel.sink), TransportSignal::Event(TransportEvent::RowChange(event.clone())))
            })
            .collect()
    }
}

struct Shared {
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<State>,
    next_channel: AtomicU64,
}

/// Transport plus remote store backed by in-memory tables.
///
/// Clone it (or wrap it in an `Arc`) to let several multiplexers share one
/// "server". Commit timestamps come from the scheduler's clock.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                scheduler,
                state: Mutex::new(State::default()),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    // ── Test controls ──────────────────────────────────────────────

    /// When false, new subscriptions are rejected.
    pub fn set_accepting(&self, accepting: bool) {
        lock(&self.shared.state).accepting = accepting;
    }

    /// When false, created rows lose the client's `client_ref`.
    pub fn set_echo_client_ref(&self, echo: bool) {
        lock(&self.shared.state).echo_client_ref = echo;
    }

    /// Latency added to every remote call.
    pub fn set_remote_delay(&self, delay: Duration) {
        lock(&self.shared.state).remote_delay = delay;
    }

    /// Fail the next remote call with `error`. Queued failures are used in order.
    pub fn fail_next_remote(&self, error: RemoteError) {
        lock(&self.shared.state).remote_failures.push_back(error);
    }

    /// Sever every channel on `topic` as a network drop would.
    pub fn drop_topic(&self, topic: &str, reason: &str) -> usize {
        let deliveries: Deliveries = {
            let mut state = lock(&self.shared.state);
            let ids: Vec<u64> = state.on_topic(topic).map(|(id, _)| id).collect();
            state.presence.remove(topic);
            ids.into_iter()
                .filter_map(|id| state.channels.remove(&id))
                .map(|channel| {
                    channel.closed.store(true, Ordering::Release);
                    let error = TransportError::Network(reason.to_string());
                    (channel.sink, TransportSignal::Dropped(error))
                })
                .collect()
        };
        debug!(%topic, %reason, channels = deliveries.len(), "dropping topic");
        let dropped = deliveries.len();
        dispatch(deliveries);
        dropped
    }

    pub fn open_count(&self, topic: &str) -> u64 {
        lock(&self.shared.state).opens.get(topic).copied().unwrap_or(0)
    }

    pub fn close_count(&self, topic: &str) -> u64 {
        lock(&self.shared.state).closes.get(topic).copied().unwrap_or(0)
    }

    pub fn open_channels(&self, topic: &str) -> usize {
        lock(&self.shared.state).on_topic(topic).count()
    }

    pub fn presence_state(&self, topic: &str) -> BTreeMap<String, Vec<Value>> {
        lock(&self.shared.state).presence_snapshot(topic)
    }

    // ── Rows ───────────────────────────────────────────────────────

    /// Upsert a record as if another client had written it.
    pub fn put_record(&self, record: Record) -> Result<(), RemoteError> {
        let now = self.shared.scheduler.now();
        let value = record.to_value().map_err(|e| RemoteError::Validation(e.to_string()))?;
        let deliveries = lock(&self.shared.state).write(record.table(), record.id(), Some(value), now);
        dispatch(deliveries);
        Ok(())
    }

    /// Delete a row as if another client had removed it. Returns whether it existed.
    pub fn remove_record(&self, table: &str, id: &RecordId) -> bool {
        let now = self.shared.scheduler.now();
        let deliveries = {
            let mut state = lock(&self.shared.state);
            if !state.tables.get(table).is_some_and(|rows| rows.contains_key(id)) {
                return false;
            }
            state.write(table, id, None, now)
        };
        dispatch(deliveries);
        true
    }

    pub fn row(&self, table: &str, id: &RecordId) -> Option<Value> {
        lock(&self.shared.state).tables.get(table).and_then(|rows| rows.get(id)).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock(&self.shared.state)
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every row of `E`'s table that decodes cleanly.
    pub fn records<E: Entity>(&self) -> Vec<E> {
        self.rows(E::TABLE).iter().filter_map(|row| decode::<E>(row).ok()).collect()
    }

    async fn remote_call(&self) -> Result<(), RemoteError> {
        let (delay, failure) = {
            let mut state = lock(&self.shared.state);
            (state.remote_delay, state.remote_failures.pop_front())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn encode<E: Entity>(record: &E) -> Result<Value, RemoteError> {
    record.clone().into_record().to_value().map_err(|e| RemoteError::Validation(e.to_string()))
}

fn decode<E: Entity>(row: &Value) -> Result<E, RemoteError> {
    let record = Record::decode(E::TABLE, row).map_err(|e| RemoteError::Validation(e.to_string()))?;
    E::from_record(record).ok_or_else(|| RemoteError::Validation(format!("row is not a `{}` record", E::TABLE)))
}

impl Transport for MemoryBackend {
    fn open(
        &self,
        spec: &ChannelSpec,
        sink: EventSink,
    ) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let id = self.shared.next_channel.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(AtomicBool::new(false));
        let deliveries = {
            let mut state = lock(&self.shared.state);
            if !state.accepting {
                return Err(TransportError::Rejected("backend is not accepting subscriptions".into()));
            }
            *state.opens.entry(spec.topic.clone()).or_default() += 1;
            state.channels.insert(
                id,
                OpenChannel { spec: spec.clone(), sink: Arc::clone(&sink), closed: Arc::clone(&closed) },
            );
            let mut deliveries = vec![(Arc::clone(&sink), TransportSignal::Subscribed)];
            let snapshot = state.presence_snapshot(&spec.topic);
            if !snapshot.is_empty() {
                let sync = PresenceEvent::Sync { state: snapshot };
                deliveries.push((sink, TransportSignal::Event(TransportEvent::Presence(sync))));
            }
            deliveries
        };
        debug!(topic = %spec.topic, channel = id, "memory channel opened");
        dispatch(deliveries);

        Ok(Arc::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
            spec: spec.clone(),
            closed,
        }))
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    spec: ChannelSpec,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn presence_key(&self) -> String {
        self.spec.presence_key.clone().unwrap_or_else(|| format!("client-{}", self.id))
    }
}

impl TransportChannel for MemoryChannel {
    fn send_broadcast(&self, message: BroadcastMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        let deliveries: Deliveries = lock(&self.shared.state)
            .on_topic(&self.spec.topic)
            .filter(|(id, _)| *id != self.id || self.spec.broadcast_self)
            .map(|(_, channel)| {
                let event = TransportEvent::Broadcast(message.clone());
                (Arc::clone(&channel.sink), TransportSignal::Event(event))
            })
            .collect();
        dispatch(deliveries);
        Ok(())
    }

    fn track(&self, meta: Value) -> Result<(), TransportError> {
        self.ensure_open()?;
        let key = self.presence_key();
        let deliveries = {
            let mut state = lock(&self.shared.state);
            let metas = state
                .presence
                .entry(self.spec.topic.clone())
                .or_default()
                .entry(key.clone())
                .or_default();
            metas.retain(|(id, _)| *id != self.id);
            metas.push((self.id, meta.clone()));
            state.presence_fanout(&self.spec.topic, PresenceEvent::Join { key, new_presences: vec![meta] })
        };
        dispatch(deliveries);
        Ok(())
    }

    fn untrack(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let deliveries = {
            let mut state = lock(&self.shared.state);
            match state.remove_presence(&self.spec.topic, self.id) {
                Some((key, left_presences)) => state
                    .presence_fanout(&self.spec.topic, PresenceEvent::Leave { key, left_presences }),
                None => Vec::new(),
            }
        };
        dispatch(deliveries);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let deliveries = {
            let mut state = lock(&self.shared.state);
            *state.closes.entry(self.spec.topic.clone()).or_default() += 1;
            state.channels.remove(&self.id);
            match state.remove_presence(&self.spec.topic, self.id) {
                Some((key, left_presences)) => state
                    .presence_fanout(&self.spec.topic, PresenceEvent::Leave { key, left_presences }),
                None => Vec::new(),
            }
        };
        debug!(topic = %self.spec.topic, channel = self.id, "memory channel closed");
        dispatch(deliveries);
    }
}

#[async_trait]
impl<E: Entity> RemoteStore<E> for MemoryBackend {
    async fn create(&self, mut record: E) -> Result<E, RemoteError> {
        self.remote_call().await?;
        record.validate().map_err(|e| RemoteError::Validation(e.to_string()))?;

        let now = self.shared.scheduler.now();
        record.set_id(RecordId::generate());
        record.stamp(now);
        let deliveries = {
            let mut state = lock(&self.shared.state);
            if !state.echo_client_ref {
                record.set_client_ref(None);
            }
            let row = encode(&record)?;
            state.write(E::TABLE, record.id(), Some(row), now)
        };
        dispatch(deliveries);
        Ok(record)
    }

    async fn update(&self, id: &RecordId, patch: &E::Patch) -> Result<E, RemoteError> {
        self.remote_call().await?;
        E::validate_patch(patch).map_err(|e| RemoteError::Validation(e.to_string()))?;

        let now = self.shared.scheduler.now();
        let (record, deliveries) = {
            let mut state = lock(&self.shared.state);
            let current = state
                .tables
                .get(E::TABLE)
                .and_then(|rows| rows.get(id))
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            let mut record: E = decode(current)?;
            record.apply_patch(patch);
            record.touch(now);
            let row = encode(&record)?;
            let deliveries = state.write(E::TABLE, id, Some(row), now);
            (record, deliveries)
        };
        dispatch(deliveries);
        Ok(record)
    }

    async fn delete(&self, id: &RecordId) -> Result<(), RemoteError> {
        self.remote_call().await?;

        let now = self.shared.scheduler.now();
        let deliveries = {
            let mut state = lock(&self.shared.state);
            let exists = state.tables.get(E::TABLE).is_some_and(|rows| rows.contains_key(id));
            if !exists {
                return Err(RemoteError::NotFound(id.to_string()));
            }
            state.write(E::TABLE, id, None, now)
        };
        dispatch(deliveries);
        Ok(())
    }
}
