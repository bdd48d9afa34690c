// Channel multiplexer: at most one transport subscription per logical key.
//
// Subscribers are reference-counted per channel. The first subscribe for a
// key opens the transport object; the last unsubscribe tears it down.
// Transport failures never reach subscriber callbacks. They move the
// channel's state machine, which callers observe via `channel_state`,
// `watch_channel_state`, or a status subscription.
//
// Locking: the channel registry lock is never held while calling into the
// transport or invoking callbacks, so both may re-enter the multiplexer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pagesync_common::presence::PresenceMeta;
use pagesync_common::protocol::realtime::BroadcastMessage;

use crate::config::{RealtimeConfig, ReconnectConfig};
use crate::connection::{is_connected_state, ConnectionState, ConnectionStateMachine, Effect};
use crate::error::{RealtimeError, TransportError};
use crate::lock;
use crate::router::{
    ChangeFilter, ChangeHandlers, EventRouter, Handler, PresenceHandlers, SubscriptionId,
};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::transport::{ChannelKey, ChannelSpec, EventSink, Transport, TransportChannel, TransportSignal};

/// Point-in-time view of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub key: ChannelKey,
    pub topic: String,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub subscriber_count: usize,
    /// How many transport objects this channel has opened (reconnects included).
    pub transport_opens: u64,
}

struct ChannelEntry {
    spec: ChannelSpec,
    machine: ConnectionStateMachine,
    router: Arc<EventRouter>,
    transport: Option<Arc<dyn TransportChannel>>,
    /// Bumped whenever a new transport object is opened; signals tagged with an
    /// older generation come from a dead transport and are ignored.
    generation: u64,
    reconnect_timer: Option<TimerHandle>,
    state_tx: watch::Sender<ConnectionState>,
    transport_opens: u64,
    /// The transport confirmed before `open` returned its handle.
    ack_pending: bool,
}

impl ChannelEntry {
    fn publish_state(&self) -> ConnectionState {
        let state = self.machine.state();
        self.state_tx.send_replace(state);
        state
    }

    /// Apply a subscribe confirmation; returns what to notify if the state moved.
    fn confirm(&mut self, key: &ChannelKey) -> Option<(Arc<EventRouter>, ConnectionState)> {
        let before = self.machine.state();
        match self.machine.on_subscribed() {
            Ok(_) if before != self.machine.state() => {
                Some((Arc::clone(&self.router), self.publish_state()))
            }
            Ok(_) => None,
            Err(error) => {
                warn!(channel = %key, %error, "ignoring subscribe confirmation");
                None
            }
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    reconnect: ReconnectConfig,
    channels: Mutex<HashMap<ChannelKey, ChannelEntry>>,
    next_subscription: AtomicU64,
    next_generation: AtomicU64,
}

/// Shared registry of realtime channels.
///
/// Cheap to clone; every clone refers to the same registry. Construct one per
/// client session and pass it to whatever needs realtime data.
#[derive(Clone)]
pub struct ChannelMultiplexer {
    inner: Arc<Inner>,
}

impl ChannelMultiplexer {
    /// Channels are opened lazily on first subscription. Dropping the last
    /// clone closes every channel still open.
    pub fn new(
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        config: &RealtimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                scheduler,
                reconnect: config.reconnect.clone(),
                channels: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// The clock driving reconnect timers, shared with whoever mounts on top.
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::clone(&self.inner.scheduler)
    }

    // ── Subscribe ──────────────────────────────────────────────────

    /// Receive row changes on `key`; `filter` selects event types (and table).
    pub fn subscribe_to_changes(
        &self,
        key: &ChannelKey,
        spec: &ChannelSpec,
        filter: ChangeFilter,
        handlers: ChangeHandlers,
    ) -> Unsubscribe {
        self.subscribe(key, spec, Handler::Changes { filter, handlers }).0
    }

    /// Receive presence sync, join and leave events on `key`.
    pub fn subscribe_to_presence(
        &self,
        key: &ChannelKey,
        spec: &ChannelSpec,
        handlers: PresenceHandlers,
    ) -> Unsubscribe {
        self.subscribe(key, spec, Handler::Presence(handlers)).0
    }

    /// Receive payloads of broadcasts named `event`. Others on the channel
    /// are not delivered here.
    pub fn subscribe_to_broadcast(
        &self,
        key: &ChannelKey,
        spec: &ChannelSpec,
        event: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let handler = Handler::Broadcast { event: event.to_string(), callback: Arc::new(callback) };
        self.subscribe(key, spec, handler).0
    }

    /// Observe state transitions of `key`. If the channel already exists the
    /// callback is invoked once right away with its current state.
    pub fn subscribe_to_status(
        &self,
        key: &ChannelKey,
        spec: &ChannelSpec,
        callback: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let callback = Arc::new(callback);
        let (handle, created) = self.subscribe(key, spec, Handler::Status(callback.clone()));
        if !created {
            if let Some(state) = self.channel_state(key) {
                callback(state);
            }
        }
        handle
    }

    fn subscribe(
        &self,
        key: &ChannelKey,
        spec: &ChannelSpec,
        handler: Handler,
    ) -> (Unsubscribe, bool) {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));

        let created = {
            let mut channels = lock(&self.inner.channels);
            if let Some(entry) = channels.get(key) {
                if entry.spec != *spec {
                    debug!(channel = %key, "channel already open with a different spec; reusing it");
                }
                entry.router.insert(id, handler);
                None
            } else {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (state_tx, _) = watch::channel(ConnectionState::Idle);
                let mut entry = ChannelEntry {
                    spec: spec.clone(),
                    machine: ConnectionStateMachine::new(key.as_str(), self.inner.reconnect.clone()),
                    router: Arc::new(EventRouter::new(key.as_str())),
                    transport: None,
                    generation,
                    reconnect_timer: None,
                    state_tx,
                    transport_opens: 0,
                    ack_pending: false,
                };
                entry.router.insert(id, handler);
                if let Err(error) = entry.machine.start() {
                    warn!(channel = %key, %error, "fresh channel refused to start");
                }
                let state = entry.publish_state();
                let router = Arc::clone(&entry.router);
                channels.insert(key.clone(), entry);
                Some((generation, router, state))
            }
        };

        let is_new = created.is_some();
        if let Some((generation, router, state)) = created {
            info!(channel = %key, topic = %spec.topic, "opening channel");
            router.notify_status(state);
            Inner::open_transport(&self.inner, key, generation);
        }

        (Unsubscribe { inner: Arc::downgrade(&self.inner), key: key.clone(), id, done: AtomicBool::new(false) }, is_new)
    }

    // ── Outbound ───────────────────────────────────────────────────

    /// Fire-and-forget broadcast on an open channel.
    pub fn broadcast(&self, key: &ChannelKey, event: &str, payload: Value) -> Result<(), RealtimeError> {
        let transport = self.connected_transport(key)?;
        transport
            .send_broadcast(BroadcastMessage { event: event.to_string(), payload })
            .map_err(RealtimeError::from)
    }

    /// Publish this client's presence on `key`.
    pub fn track_presence(&self, key: &ChannelKey, meta: &PresenceMeta) -> Result<(), RealtimeError> {
        let value =
            serde_json::to_value(meta).map_err(|error| RealtimeError::Encode(error.to_string()))?;
        self.connected_transport(key)?.track(value).map_err(RealtimeError::from)
    }

    /// Withdraw this client's presence; peers see a leave.
    pub fn untrack_presence(&self, key: &ChannelKey) -> Result<(), RealtimeError> {
        self.connected_transport(key)?.untrack().map_err(RealtimeError::from)
    }

    fn connected_transport(&self, key: &ChannelKey) -> Result<Arc<dyn TransportChannel>, RealtimeError> {
        let channels = lock(&self.inner.channels);
        let entry =
            channels.get(key).ok_or_else(|| RealtimeError::UnknownChannel(key.to_string()))?;
        let state = entry.machine.state();
        match (&entry.transport, is_connected_state(state)) {
            (Some(transport), true) => Ok(Arc::clone(transport)),
            _ => Err(RealtimeError::NotConnected { key: key.to_string(), state }),
        }
    }

    // ── Introspection ──────────────────────────────────────────────

    /// `None` when no channel is registered under `key`.
    pub fn channel_state(&self, key: &ChannelKey) -> Option<ConnectionState> {
        lock(&self.inner.channels).get(key).map(|entry| entry.machine.state())
    }

    /// Snapshot of a channel's state, retry bookkeeping and subscriber count.
    pub fn channel_info(&self, key: &ChannelKey) -> Option<ChannelInfo> {
        lock(&self.inner.channels).get(key).map(|entry| ChannelInfo {
            key: key.clone(),
            topic: entry.spec.topic.clone(),
            state: entry.machine.state(),
            retry_count: entry.machine.retry_count(),
            last_error: entry.machine.last_error().map(str::to_string),
            subscriber_count: entry.router.len(),
            transport_opens: entry.transport_opens,
        })
    }

    /// Async view of a channel's state. The receiver sees `Closed` when the
    /// channel is torn down.
    pub fn watch_channel_state(&self, key: &ChannelKey) -> Option<watch::Receiver<ConnectionState>> {
        lock(&self.inner.channels).get(key).map(|entry| entry.state_tx.subscribe())
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    /// Registered keys, sorted.
    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = lock(&self.inner.channels).keys().cloned().collect();
        keys.sort();
        keys
    }

    // ── Teardown / recovery ────────────────────────────────────────

    /// Tear a channel down regardless of how many subscribers it has.
    /// Outstanding `Unsubscribe` handles for it become no-ops.
    pub fn remove_channel(&self, key: &ChannelKey) -> bool {
        let removed = lock(&self.inner.channels).remove(key);
        match removed {
            Some(entry) => {
                Inner::teardown(key, entry);
                true
            }
            None => false,
        }
    }

    /// Restart a channel that gave up after exhausting its retry budget.
    pub fn retry_channel(&self, key: &ChannelKey) -> Result<(), RealtimeError> {
        let (generation, router, state) = {
            let mut channels = lock(&self.inner.channels);
            let entry = channels
                .get_mut(key)
                .ok_or_else(|| RealtimeError::UnknownChannel(key.to_string()))?;
            entry.machine.retry()?;
            if let Some(timer) = entry.reconnect_timer.take() {
                timer.cancel();
            }
            entry.generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            (entry.generation, Arc::clone(&entry.router), entry.publish_state())
        };

        info!(channel = %key, "manual channel retry");
        router.notify_status(state);
        Inner::open_transport(&self.inner, key, generation);
        Ok(())
    }

    /// Tear down every channel.
    pub fn shutdown(&self) {
        let drained: Vec<(ChannelKey, ChannelEntry)> =
            lock(&self.inner.channels).drain().collect();
        if !drained.is_empty() {
            info!(channels = drained.len(), "shutting down realtime channels");
        }
        for (key, entry) in drained {
            Inner::teardown(&key, entry);
        }
    }
}

impl Inner {
    fn sink(inner: &Arc<Inner>, key: &ChannelKey, generation: u64) -> EventSink {
        let weak = Arc::downgrade(inner);
        let key = key.clone();
        Arc::new(move |signal| {
            if let Some(inner) = weak.upgrade() {
                Inner::handle_signal(&inner, &key, generation, signal);
            }
        })
    }

    fn open_transport(inner: &Arc<Inner>, key: &ChannelKey, generation: u64) {
        let spec = {
            let channels = lock(&inner.channels);
            match channels.get(key) {
                Some(entry) if entry.generation == generation => entry.spec.clone(),
                _ => return,
            }
        };

        let sink = Inner::sink(inner, key, generation);
        match inner.transport.open(&spec, sink) {
            Ok(handle) => {
                let (stale, notify) = {
                    let mut channels = lock(&inner.channels);
                    match channels.get_mut(key) {
                        Some(entry)
                            if entry.generation == generation
                                && entry.machine.state() != ConnectionState::Closed =>
                        {
                            entry.transport_opens += 1;
                            entry.transport = Some(handle);
                            let notify = if std::mem::take(&mut entry.ack_pending) {
                                entry.confirm(key)
                            } else {
                                None
                            };
                            (None, notify)
                        }
                        _ => (Some(handle), None),
                    }
                };
                // Torn down or superseded while the subscribe was in flight.
                if let Some(handle) = stale {
                    handle.close();
                }
                if let Some((router, state)) = notify {
                    info!(channel = %key, "channel connected");
                    router.notify_status(state);
                }
            }
            Err(error) => {
                warn!(channel = %key, %error, "transport subscribe failed");
                Inner::handle_failure(inner, key, generation, error);
            }
        }
    }

    fn handle_signal(inner: &Arc<Inner>, key: &ChannelKey, generation: u64, signal: TransportSignal) {
        match signal {
            TransportSignal::Subscribed => {
                let notify = {
                    let mut channels = lock(&inner.channels);
                    let Some(entry) = channels.get_mut(key) else {
                        return;
                    };
                    if entry.generation != generation {
                        return;
                    }
                    if entry.transport.is_none() {
                        entry.ack_pending = true;
                        return;
                    }
                    entry.confirm(key)
                };
                if let Some((router, state)) = notify {
                    info!(channel = %key, "channel connected");
                    router.notify_status(state);
                }
            }
            TransportSignal::Failed(error) | TransportSignal::Dropped(error) => {
                Inner::handle_failure(inner, key, generation, error);
            }
            TransportSignal::Event(event) => {
                let router = {
                    let channels = lock(&inner.channels);
                    match channels.get(key) {
                        Some(entry) if entry.generation == generation => Arc::clone(&entry.router),
                        _ => return,
                    }
                };
                router.dispatch(&event);
            }
        }
    }

    fn handle_failure(inner: &Arc<Inner>, key: &ChannelKey, generation: u64, error: TransportError) {
        let (dead, router, state) = {
            let mut channels = lock(&inner.channels);
            let Some(entry) = channels.get_mut(key) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            let dead = entry.transport.take();
            entry.ack_pending = false;

            match entry.machine.on_failure(error.to_string()) {
                Ok(Effect::ScheduleReconnect { attempt, delay }) => {
                    let next = inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    entry.generation = next;
                    let weak = Arc::downgrade(inner);
                    let retry_key = key.clone();
                    let timer = inner.scheduler.schedule(
                        delay,
                        Box::new(move || {
                            if let Some(inner) = weak.upgrade() {
                                Inner::reconnect(&inner, &retry_key, next);
                            }
                        }),
                    );
                    if let Some(previous) = entry.reconnect_timer.replace(timer) {
                        previous.cancel();
                    }
                    warn!(
                        channel = %key,
                        %error,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "channel lost; reconnect scheduled"
                    );
                }
                Ok(Effect::GiveUp) => {
                    entry.generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %key, %error, "channel retry budget exhausted");
                }
                Ok(_) => {}
                Err(transition) => {
                    warn!(channel = %key, %error, %transition, "ignoring transport failure");
                    return;
                }
            }
            (dead, Arc::clone(&entry.router), entry.publish_state())
        };

        if let Some(dead) = dead {
            dead.close();
        }
        router.notify_status(state);
    }

    fn reconnect(inner: &Arc<Inner>, key: &ChannelKey, generation: u64) {
        {
            let mut channels = lock(&inner.channels);
            let Some(entry) = channels.get_mut(key) else {
                return;
            };
            if entry.generation != generation
                || entry.machine.state() != ConnectionState::Reconnecting
            {
                return;
            }
            entry.reconnect_timer = None;
            debug!(channel = %key, attempt = entry.machine.retry_count(), "reissuing transport subscribe");
        }
        Inner::open_transport(inner, key, generation);
    }

    fn remove_subscription(inner: &Arc<Inner>, key: &ChannelKey, id: SubscriptionId) {
        let emptied = {
            let mut channels = lock(&inner.channels);
            let Some(entry) = channels.get(key) else {
                return;
            };
            if !entry.router.remove(id) || !entry.router.is_empty() {
                return;
            }
            channels.remove(key)
        };
        if let Some(entry) = emptied {
            Inner::teardown(key, entry);
        }
    }

    fn teardown(key: &ChannelKey, mut entry: ChannelEntry) {
        if let Some(timer) = entry.reconnect_timer.take() {
            timer.cancel();
        }
        if entry.machine.close() == Effect::Unsubscribe {
            if let Some(transport) = entry.transport.take() {
                transport.close();
            }
        }
        let state = entry.publish_state();
        info!(channel = %key, "channel closed");
        entry.router.notify_status(state);
        entry.router.clear();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let channels = self.channels.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, mut entry) in channels.drain() {
            if let Some(timer) = entry.reconnect_timer.take() {
                timer.cancel();
            }
            if let Some(transport) = entry.transport.take() {
                transport.close();
            }
        }
    }
}

/// Disposer for one subscription.
///
/// Unsubscribing is idempotent and safe after the channel was already torn
/// down by someone else. Dropping the handle unsubscribes.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct Unsubscribe {
    inner: Weak<Inner>,
    key: ChannelKey,
    id: SubscriptionId,
    done: AtomicBool,
}

impl Unsubscribe {
    /// Idempotent. The last subscriber to leave closes the channel.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            Inner::remove_subscription(&inner, &self.key, self.id);
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// False once unsubscribed, or once every handle to the multiplexer is
    /// gone and its channels were closed with it.
    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire) && self.inner.strong_count() > 0
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
