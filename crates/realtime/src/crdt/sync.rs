// Relays a replica's deltas over the record's broadcast channel.
//
//   uninitialized → initializing → live → closed
//
// While initializing, and while a remote delta is being applied, the update
// observer stays silent: bootstrap state and echoes are never broadcast.
// The replica goes live a fixed delay after the channel reports connected.
//
// Every outgoing delta carries the sender's state vector from before the
// edit. Incoming deltas wait in the replica's inbox until that much history
// has arrived, so the relay may reorder or repeat them freely.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, info, warn};

use pagesync_common::crdt::envelope::{DeltaEnvelope, DocId};
use pagesync_common::types::RecordId;

use crate::config::CrdtConfig;
use crate::connection::ConnectionState;
use crate::error::DeltaError;
use crate::lock;
use crate::multiplexer::{ChannelMultiplexer, Unsubscribe};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::transport::{ChannelKey, ChannelSpec};

use super::replica::{Delivery, TextReplica, UpdateNotice, REMOTE_ORIGIN, SEED_ORIGIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPhase {
    Uninitialized,
    Initializing,
    Live,
    Closed,
}

impl fmt::Display for ReplicaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Live => "live",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Content to load before the replica goes live. Never broadcast.
#[derive(Debug, Clone, Default)]
pub enum Seed {
    #[default]
    Empty,
    Text(String),
    /// A full v1-encoded document state.
    State(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub sent: u64,
    /// Remote deltas integrated into the document.
    pub applied: u64,
    /// Deltas this replica sent, received back on the topic.
    pub self_echoes: u64,
    pub rejected: u64,
    /// Remote deltas currently waiting for earlier history.
    pub held: u64,
    /// Waiting deltas discarded after the backlog overflowed.
    pub dropped: u64,
}

/// Broadcast channel shared by every text field of one record.
pub fn document_channel(record_id: &RecordId) -> ChannelSpec {
    ChannelSpec::topic(format!("doc:{record_id}"))
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    applied: AtomicU64,
    self_echoes: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

struct SyncInner {
    doc_id: DocId,
    sender_id: String,
    key: ChannelKey,
    config: CrdtConfig,
    replica: TextReplica,
    mux: ChannelMultiplexer,
    scheduler: Arc<dyn Scheduler>,
    phase: Mutex<ReplicaPhase>,
    initializing: AtomicBool,
    applying_remote: AtomicBool,
    live_timer: Mutex<Option<TimerHandle>>,
    observer: Mutex<Option<yrs::Subscription>>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
    counters: Counters,
}

/// A mounted text replica kept in sync with its peers. Dropping it unmounts.
pub struct CrdtSynchronizer {
    inner: Arc<SyncInner>,
}

impl CrdtSynchronizer {
    /// Mount a replica of `doc_id` on the broadcast channel described by `spec`.
    pub fn mount(
        mux: &ChannelMultiplexer,
        spec: &ChannelSpec,
        doc_id: DocId,
        sender_id: impl Into<String>,
        config: &CrdtConfig,
        seed: Seed,
    ) -> Result<Self, DeltaError> {
        let inner = Arc::new(SyncInner {
            doc_id,
            sender_id: sender_id.into(),
            key: spec.key(),
            config: config.clone(),
            replica: TextReplica::new(&config.text_name),
            mux: mux.clone(),
            scheduler: mux.scheduler(),
            phase: Mutex::new(ReplicaPhase::Uninitialized),
            initializing: AtomicBool::new(false),
            applying_remote: AtomicBool::new(false),
            live_timer: Mutex::new(None),
            observer: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });

        inner.initializing.store(true, Ordering::Release);
        inner.set_phase(ReplicaPhase::Initializing);

        let weak = Arc::downgrade(&inner);
        let observer = inner.replica.observe_updates(move |notice| {
            if let Some(inner) = weak.upgrade() {
                inner.on_local_update(notice);
            }
        })?;
        *lock(&inner.observer) = Some(observer);

        match seed {
            Seed::Empty => {}
            Seed::Text(text) => inner.replica.seed_text(&text),
            Seed::State(state) => inner.replica.apply_update(&state, SEED_ORIGIN)?,
        }

        let weak = Arc::downgrade(&inner);
        let deltas = mux.subscribe_to_broadcast(
            &inner.key,
            spec,
            &config.broadcast_event,
            move |payload: &Value| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_broadcast(payload);
                }
            },
        );
        lock(&inner.subscriptions).push(deltas);

        let weak: Weak<SyncInner> = Arc::downgrade(&inner);
        let status = mux.subscribe_to_status(&inner.key, spec, move |state: ConnectionState| {
            if let Some(inner) = weak.upgrade() {
                inner.on_status(state);
            }
        });
        lock(&inner.subscriptions).push(status);

        info!(doc_id = %inner.doc_id, channel = %inner.key, "replica mounted");
        Ok(Self { inner })
    }

    pub fn doc_id(&self) -> &DocId {
        &self.inner.doc_id
    }

    pub fn sender_id(&self) -> &str {
        &self.inner.sender_id
    }

    pub fn phase(&self) -> ReplicaPhase {
        *lock(&self.inner.phase)
    }

    pub fn is_initializing(&self) -> bool {
        self.inner.initializing.load(Ordering::Acquire)
    }

    pub fn get_document_content(&self) -> String {
        self.inner.replica.content()
    }

    /// Replace the whole text. Produces no delta when nothing changed.
    pub fn update_content(&self, text: &str) -> bool {
        self.inner.replica.replace(text)
    }

    /// Insert at a char position.
    pub fn insert(&self, index: u32, chunk: &str) {
        self.inner.replica.insert(index, chunk);
    }

    /// Remove `len` chars starting at `index`.
    pub fn remove(&self, index: u32, len: u32) {
        self.inner.replica.remove(index, len);
    }

    /// Full document state, v1-encoded.
    pub fn encode_state(&self) -> Vec<u8> {
        self.inner.replica.encode_state()
    }

    /// Handle a broadcast payload as if it had arrived on the channel.
    /// Own echoes and other documents' deltas yield an empty [`Delivery`].
    pub fn receive(&self, payload: &Value) -> Result<Delivery, DeltaError> {
        self.inner.receive(payload)
    }

    pub fn stats(&self) -> SyncStats {
        let c = &self.inner.counters;
        SyncStats {
            sent: c.sent.load(Ordering::Relaxed),
            applied: c.applied.load(Ordering::Relaxed),
            self_echoes: c.self_echoes.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            held: self.inner.replica.held() as u64,
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    /// Unmount: stop observing, cancel the live timer, leave the channel.
    /// Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for CrdtSynchronizer {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for CrdtSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrdtSynchronizer")
            .field("doc_id", &self.inner.doc_id)
            .field("sender_id", &self.inner.sender_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SyncInner {
    fn set_phase(&self, to: ReplicaPhase) {
        let mut phase = lock(&self.phase);
        debug!(doc_id = %self.doc_id, from = %*phase, to = %to, "replica phase transition");
        *phase = to;
    }

    // ── Local edit path ────────────────────────────────────────────

    fn on_local_update(&self, notice: &UpdateNotice<'_>) {
        if self.initializing.load(Ordering::Acquire)
            || self.applying_remote.load(Ordering::Acquire)
            || notice.origin == Some(REMOTE_ORIGIN.as_bytes())
        {
            return;
        }

        let envelope = DeltaEnvelope {
            doc_id: self.doc_id.clone(),
            sender_id: self.sender_id.clone(),
            delta: BASE64.encode(notice.update),
            context: Some(BASE64.encode(notice.context())),
            timestamp: self.scheduler.now(),
        };
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(doc_id = %self.doc_id, %error, "failed to encode delta envelope");
                return;
            }
        };
        match self.mux.broadcast(&self.key, &self.config.broadcast_event, payload) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                // Peers catch up from persisted content; the delta is not queued.
                warn!(doc_id = %self.doc_id, %error, "delta broadcast failed");
            }
        }
    }

    // ── Remote edit path ───────────────────────────────────────────

    fn on_broadcast(&self, payload: &Value) {
        if let Err(error) = self.receive(payload) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(doc_id = %self.doc_id, %error, "dropping undecodable delta");
        }
    }

    fn receive(&self, payload: &Value) -> Result<Delivery, DeltaError> {
        let envelope: DeltaEnvelope = serde_json::from_value(payload.clone())?;
        if envelope.sender_id == self.sender_id {
            self.counters.self_echoes.fetch_add(1, Ordering::Relaxed);
            return Ok(Delivery::default());
        }
        if envelope.doc_id != self.doc_id || *lock(&self.phase) == ReplicaPhase::Closed {
            return Ok(Delivery::default());
        }

        let delta = BASE64.decode(envelope.delta.as_bytes())?;
        let context = envelope.context.as_deref().map(|c| BASE64.decode(c.as_bytes())).transpose()?;
        self.applying_remote.store(true, Ordering::Release);
        let delivery = self.replica.receive(&delta, context.as_deref(), REMOTE_ORIGIN);
        self.applying_remote.store(false, Ordering::Release);
        let delivery = delivery?;

        self.counters.applied.fetch_add(delivery.applied as u64, Ordering::Relaxed);
        debug!(
            doc_id = %self.doc_id,
            from = %envelope.sender_id,
            applied = delivery.applied,
            held = delivery.held,
            "remote delta received"
        );
        if delivery.held > self.config.max_held_deltas {
            let dropped = self.replica.clear_held();
            self.counters.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(doc_id = %self.doc_id, dropped, "delta backlog overflowed, discarding held deltas");
        }
        Ok(delivery)
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    fn on_status(self: &Arc<Self>, state: ConnectionState) {
        if state != ConnectionState::Connected || *lock(&self.phase) != ReplicaPhase::Initializing {
            return;
        }
        let mut timer = lock(&self.live_timer);
        if timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *timer = Some(self.scheduler.schedule(
            self.config.live_delay(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.go_live();
                }
            }),
        ));
    }

    fn go_live(&self) {
        {
            let mut phase = lock(&self.phase);
            if *phase != ReplicaPhase::Initializing {
                return;
            }
            *phase = ReplicaPhase::Live;
        }
        self.initializing.store(false, Ordering::Release);
        lock(&self.live_timer).take();
        info!(doc_id = %self.doc_id, "replica live");
    }

    fn close(&self) {
        {
            let mut phase = lock(&self.phase);
            if *phase == ReplicaPhase::Closed {
                return;
            }
            *phase = ReplicaPhase::Closed;
        }
        if let Some(timer) = lock(&self.live_timer).take() {
            timer.cancel();
        }
        let observer = lock(&self.observer).take();
        drop(observer);
        let subscriptions: Vec<Unsubscribe> = lock(&self.subscriptions).drain(..).collect();
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        info!(doc_id = %self.doc_id, "replica closed");
    }
}
