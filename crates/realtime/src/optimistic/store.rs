// Optimistic overlay for one entity collection.
//
// Three kinds of entries sit on top of the caller's confirmed list:
//   create  (temporary id, 10s)   update (merged patch, 30s)   delete (tombstone, 30s)
//
// At most one live entry exists per (kind, id). Every entry expires on its
// own timer; explicit clears cancel that timer, and each timer carries the
// sequence number of the entry it was armed for, so a stale timer can never
// remove a newer entry that reused the same id.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};

use pagesync_common::protocol::realtime::RowEventType;
use pagesync_common::types::RecordId;

use crate::config::OptimisticConfig;
use crate::error::{MutationError, RemoteError};
use crate::lock;
use crate::multiplexer::{ChannelMultiplexer, Unsubscribe};
use crate::router::{ChangeFilter, ChangeHandlers, RowChange};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::transport::{ChannelKey, ChannelSpec};

use super::entity::{Entity, Patch};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing outcome of a remote mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationNotice {
    Confirmed { collection: String, kind: MutationKind, id: RecordId },
    /// The remote call failed and the overlay was rolled back.
    Failed { collection: String, kind: MutationKind, id: RecordId, error: RemoteError },
}

/// Counts of live overlay entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlaySummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl OverlaySummary {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

/// A pending overlay entry as seen from outside the store.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub kind: MutationKind,
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

struct Slot<T> {
    value: T,
    created_at: DateTime<Utc>,
    ttl: Duration,
    seq: u64,
    timer: TimerHandle,
}

impl<T> Slot<T> {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        let deadline = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl));
        deadline.map_or(true, |deadline| now < deadline)
    }
}

struct Overlay<E: Entity> {
    next_seq: u64,
    creates: HashMap<RecordId, Slot<E>>,
    updates: HashMap<RecordId, Slot<E::Patch>>,
    deletes: HashMap<RecordId, Slot<()>>,
}

impl<E: Entity> Overlay<E> {
    fn remove(&mut self, kind: MutationKind, id: &RecordId) -> Option<TimerHandle> {
        match kind {
            MutationKind::Create => self.creates.remove(id).map(|slot| slot.timer),
            MutationKind::Update => self.updates.remove(id).map(|slot| slot.timer),
            MutationKind::Delete => self.deletes.remove(id).map(|slot| slot.timer),
        }
    }

    fn seq_of(&self, kind: MutationKind, id: &RecordId) -> Option<u64> {
        match kind {
            MutationKind::Create => self.creates.get(id).map(|slot| slot.seq),
            MutationKind::Update => self.updates.get(id).map(|slot| slot.seq),
            MutationKind::Delete => self.deletes.get(id).map(|slot| slot.seq),
        }
    }
}

pub(crate) struct StoreInner<E: Entity> {
    collection: String,
    scheduler: Arc<dyn Scheduler>,
    pub(crate) config: OptimisticConfig,
    overlay: Mutex<Overlay<E>>,
    notices: broadcast::Sender<MutationNotice>,
}

/// Optimistic overlay for one collection (for example "pages in workspace W").
///
/// Cheap to clone; clones share the overlay.
pub struct OptimisticStore<E: Entity> {
    pub(crate) inner: Arc<StoreInner<E>>,
}

impl<E: Entity> Clone for OptimisticStore<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Entity> OptimisticStore<E> {
    pub fn new(
        collection: impl Into<String>,
        scheduler: Arc<dyn Scheduler>,
        config: OptimisticConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                collection: collection.into(),
                scheduler,
                config,
                overlay: Mutex::new(Overlay {
                    next_seq: 1,
                    creates: HashMap::new(),
                    updates: HashMap::new(),
                    deletes: HashMap::new(),
                }),
                notices,
            }),
        }
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    pub fn config(&self) -> &OptimisticConfig {
        &self.inner.config
    }

    /// Stream of confirmation and rollback notices for this collection.
    pub fn notices(&self) -> broadcast::Receiver<MutationNotice> {
        self.inner.notices.subscribe()
    }

    // ── Overlay writes ─────────────────────────────────────────────

    /// Stage a create under a fresh temporary id and return that id.
    pub fn optimistic_create(&self, draft: E) -> Result<RecordId, MutationError> {
        self.stage_create(draft).map(|(id, _)| id)
    }

    /// Stage a partial update. A second update for the same id merges into
    /// the live entry and restarts its ttl.
    pub fn optimistic_update(&self, id: &RecordId, patch: E::Patch) -> Result<(), MutationError> {
        self.stage_update(id, patch).map(|_| ())
    }

    /// Tombstone `id` so the merged view hides it.
    pub fn optimistic_delete(&self, id: &RecordId) {
        self.stage_delete(id);
    }

    pub(crate) fn stage_create(&self, mut draft: E) -> Result<(RecordId, E), MutationError> {
        draft.validate()?;

        let id = RecordId::temporary();
        draft.set_id(id.clone());
        if draft.client_ref().is_none() {
            draft.set_client_ref(Some(id.to_string()));
        }
        let now = self.inner.scheduler.now();
        draft.stamp(now);

        let ttl = self.inner.config.create_ttl();
        let mut overlay = lock(&self.inner.overlay);
        let seq = self.next_seq(&mut overlay);
        let timer = self.arm_expiry(MutationKind::Create, &id, seq, ttl);
        overlay
            .creates
            .insert(id.clone(), Slot { value: draft.clone(), created_at: now, ttl, seq, timer });
        debug!(collection = %self.inner.collection, id = %id, "optimistic create staged");
        Ok((id, draft))
    }

    pub(crate) fn stage_update(&self, id: &RecordId, patch: E::Patch) -> Result<u64, MutationError> {
        E::validate_patch(&patch)?;

        let now = self.inner.scheduler.now();
        let ttl = self.inner.config.update_ttl();
        let mut overlay = lock(&self.inner.overlay);
        let merged = match overlay.updates.remove(id) {
            Some(previous) => {
                previous.timer.cancel();
                let mut merged = previous.value;
                merged.merge(patch);
                merged
            }
            None => patch,
        };
        let seq = self.next_seq(&mut overlay);
        let timer = self.arm_expiry(MutationKind::Update, id, seq, ttl);
        overlay.updates.insert(id.clone(), Slot { value: merged, created_at: now, ttl, seq, timer });
        debug!(collection = %self.inner.collection, id = %id, "optimistic update staged");
        Ok(seq)
    }

    pub(crate) fn stage_delete(&self, id: &RecordId) -> u64 {
        let now = self.inner.scheduler.now();
        let ttl = self.inner.config.delete_ttl();
        let mut overlay = lock(&self.inner.overlay);
        if let Some(previous) = overlay.deletes.remove(id) {
            previous.timer.cancel();
        }
        let seq = self.next_seq(&mut overlay);
        let timer = self.arm_expiry(MutationKind::Delete, id, seq, ttl);
        overlay.deletes.insert(id.clone(), Slot { value: (), created_at: now, ttl, seq, timer });
        debug!(collection = %self.inner.collection, id = %id, "optimistic delete staged");
        seq
    }

    fn next_seq(&self, overlay: &mut Overlay<E>) -> u64 {
        let seq = overlay.next_seq;
        overlay.next_seq += 1;
        seq
    }

    fn arm_expiry(&self, kind: MutationKind, id: &RecordId, seq: u64, ttl: Duration) -> TimerHandle {
        let weak: Weak<StoreInner<E>> = Arc::downgrade(&self.inner);
        let id = id.clone();
        self.inner.scheduler.schedule(
            ttl,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    OptimisticStore { inner }.expire(kind, &id, seq);
                }
            }),
        )
    }

    fn expire(&self, kind: MutationKind, id: &RecordId, seq: u64) {
        let mut overlay = lock(&self.inner.overlay);
        if overlay.seq_of(kind, id) == Some(seq) {
            overlay.remove(kind, id);
            debug!(collection = %self.inner.collection, %kind, id = %id, "optimistic entry expired");
        }
    }

    // ── Overlay clears ─────────────────────────────────────────────

    pub fn clear_optimistic_creation(&self, temp_id: &RecordId) -> bool {
        self.clear(MutationKind::Create, temp_id)
    }

    pub fn clear_optimistic_update(&self, id: &RecordId) -> bool {
        self.clear(MutationKind::Update, id)
    }

    pub fn clear_optimistic_deletion(&self, id: &RecordId) -> bool {
        self.clear(MutationKind::Delete, id)
    }

    fn clear(&self, kind: MutationKind, id: &RecordId) -> bool {
        let timer = lock(&self.inner.overlay).remove(kind, id);
        match timer {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Clear only if the entry is still the one staged as `seq`.
    pub(crate) fn clear_if_current(&self, kind: MutationKind, id: &RecordId, seq: u64) -> bool {
        let timer = {
            let mut overlay = lock(&self.inner.overlay);
            if overlay.seq_of(kind, id) != Some(seq) {
                return false;
            }
            overlay.remove(kind, id)
        };
        if let Some(timer) = &timer {
            timer.cancel();
        }
        timer.is_some()
    }

    /// Drop every overlay entry. Returns how many were dropped.
    pub fn revert_all_optimistic_changes(&self) -> usize {
        let drained: Vec<TimerHandle> = {
            let mut overlay = lock(&self.inner.overlay);
            let creates = overlay.creates.drain().map(|(_, slot)| slot.timer);
            let mut timers: Vec<TimerHandle> = creates.collect();
            timers.extend(overlay.updates.drain().map(|(_, slot)| slot.timer));
            timers.extend(overlay.deletes.drain().map(|(_, slot)| slot.timer));
            timers
        };
        for timer in &drained {
            timer.cancel();
        }
        if !drained.is_empty() {
            info!(
                collection = %self.inner.collection,
                entries = drained.len(),
                "reverted all optimistic changes"
            );
        }
        drained.len()
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// The confirmed list with the live overlay applied on top.
    ///
    /// Tombstoned ids are dropped, pending patches applied, and pending
    /// creates appended in staging order unless a confirmed record already
    /// stands for them.
    pub fn merged_view(&self, confirmed: &[E]) -> Vec<E> {
        let now = self.inner.scheduler.now();
        let overlay = lock(&self.inner.overlay);

        let tombstoned =
            |id: &RecordId| overlay.deletes.get(id).is_some_and(|slot| slot.is_live(now));
        let patched = |mut record: E| {
            if let Some(slot) = overlay.updates.get(record.id()) {
                if slot.is_live(now) {
                    record.apply_patch(&slot.value);
                }
            }
            record
        };

        let mut view: Vec<E> = confirmed
            .iter()
            .filter(|record| !tombstoned(record.id()))
            .cloned()
            .map(&patched)
            .collect();

        let mut creates: Vec<&Slot<E>> =
            overlay.creates.values().filter(|slot| slot.is_live(now)).collect();
        creates.sort_by_key(|slot| slot.seq);
        for slot in creates {
            let pending = &slot.value;
            if tombstoned(pending.id())
                || confirmed.iter().any(|record| self.is_reconciled_by(pending, record))
            {
                continue;
            }
            view.push(patched(pending.clone()));
        }
        view
    }

    /// Whether `confirmed` is the authoritative version of the pending create.
    pub fn is_reconciled_by(&self, pending: &E, confirmed: &E) -> bool {
        if confirmed.id() == pending.id() {
            return true;
        }
        if confirmed.client_ref().is_some_and(|client_ref| client_ref == pending.id().as_str()) {
            return true;
        }
        let window = Duration::from_millis(self.inner.config.reconcile_window_ms);
        self.inner.config.heuristic_matching
            && pending.match_key().matches(&confirmed.match_key(), window)
    }

    pub fn summary(&self) -> OverlaySummary {
        let now = self.inner.scheduler.now();
        let overlay = lock(&self.inner.overlay);
        OverlaySummary {
            creates: overlay.creates.values().filter(|s| s.is_live(now)).count(),
            updates: overlay.updates.values().filter(|s| s.is_live(now)).count(),
            deletes: overlay.deletes.values().filter(|s| s.is_live(now)).count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary().total() == 0
    }

    /// Live entries, oldest first.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let now = self.inner.scheduler.now();
        let overlay = lock(&self.inner.overlay);
        let mut entries: Vec<(u64, EntryInfo)> = Vec::new();
        let mut collect = |kind, id: &RecordId, created_at, ttl, seq, live: bool| {
            if live {
                entries.push((seq, EntryInfo { kind, id: id.clone(), created_at, ttl }));
            }
        };
        for (id, s) in &overlay.creates {
            collect(MutationKind::Create, id, s.created_at, s.ttl, s.seq, s.is_live(now));
        }
        for (id, s) in &overlay.updates {
            collect(MutationKind::Update, id, s.created_at, s.ttl, s.seq, s.is_live(now));
        }
        for (id, s) in &overlay.deletes {
            collect(MutationKind::Delete, id, s.created_at, s.ttl, s.seq, s.is_live(now));
        }
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    pub fn pending_create(&self, temp_id: &RecordId) -> Option<E> {
        let now = self.inner.scheduler.now();
        lock(&self.inner.overlay)
            .creates
            .get(temp_id)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    pub fn pending_update(&self, id: &RecordId) -> Option<E::Patch> {
        let now = self.inner.scheduler.now();
        lock(&self.inner.overlay)
            .updates
            .get(id)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    pub fn is_tombstoned(&self, id: &RecordId) -> bool {
        let now = self.inner.scheduler.now();
        lock(&self.inner.overlay).deletes.get(id).is_some_and(|slot| slot.is_live(now))
    }

    // ── Change feed ────────────────────────────────────────────────

    /// Drop overlay entries the change feed has made redundant: creates that
    /// an inserted record stands for, and tombstones whose delete arrived.
    /// Returns how many entries were dropped.
    pub fn reconcile(&self, change: &RowChange) -> usize {
        if change.table != E::TABLE {
            return 0;
        }
        let timers: Vec<TimerHandle> = match change.event_type {
            RowEventType::Insert | RowEventType::Update => {
                let Some(confirmed) = change.new.clone().and_then(E::from_record) else {
                    return 0;
                };
                let mut overlay = lock(&self.inner.overlay);
                let matched: Vec<RecordId> = overlay
                    .creates
                    .iter()
                    .filter(|(_, slot)| self.is_reconciled_by(&slot.value, &confirmed))
                    .map(|(id, _)| id.clone())
                    .collect();
                let timers = matched
                    .iter()
                    .filter_map(|id| overlay.remove(MutationKind::Create, id))
                    .collect();
                timers
            }
            RowEventType::Delete => {
                let Some(id) = change.record_id().cloned() else {
                    return 0;
                };
                lock(&self.inner.overlay).remove(MutationKind::Delete, &id).into_iter().collect()
            }
        };
        for timer in &timers {
            timer.cancel();
        }
        if !timers.is_empty() {
            debug!(
                collection = %self.inner.collection,
                event = %change.event_type,
                dropped = timers.len(),
                "overlay reconciled against change feed"
            );
        }
        timers.len()
    }

    /// Reconcile this overlay against every row change on `key`.
    pub fn follow(&self, mux: &ChannelMultiplexer, key: &ChannelKey, spec: &ChannelSpec) -> Unsubscribe {
        let store = self.clone();
        mux.subscribe_to_changes(
            key,
            spec,
            ChangeFilter::all().for_table(E::TABLE),
            ChangeHandlers::on_any(move |change: &RowChange| {
                store.reconcile(change);
            }),
        )
    }

    pub(crate) fn scheduler(&self) -> &dyn Scheduler {
        self.inner.scheduler.as_ref()
    }

    pub(crate) fn notify(&self, notice: MutationNotice) {
        // No receivers is fine.
        let _ = self.inner.notices.send(notice);
    }
}

impl<E: Entity> fmt::Debug for OptimisticStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticStore")
            .field("collection", &self.inner.collection)
            .field("summary", &self.summary())
            .finish()
    }
}
