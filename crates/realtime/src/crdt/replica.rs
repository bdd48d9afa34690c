// One shared text inside a yrs document.
//
// Positions are counted in chars and converted to the document's byte
// offsets at the edge. Remote deltas go through a causal inbox: a delta is
// integrated only once this replica has everything its author had when the
// delta was made, so deletes never reach the document ahead of their targets.

use std::sync::Mutex;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::error::DeltaError;
use crate::lock;

/// Transaction origin for updates received from other replicas.
pub const REMOTE_ORIGIN: &str = "remote";
/// Transaction origin for seed content applied while mounting.
pub const SEED_ORIGIN: &str = "seed";

/// A committed transaction, as handed to [`TextReplica::observe_updates`].
pub struct UpdateNotice<'a> {
    pub origin: Option<&'a [u8]>,
    /// The v1-encoded delta.
    pub update: &'a [u8],
    before: &'a StateVector,
}

impl UpdateNotice<'_> {
    /// What the document had seen when the transaction began, v1-encoded.
    /// A receiver must have at least this much before the delta applies.
    pub fn context(&self) -> Vec<u8> {
        self.before.encode_v1()
    }
}

/// Result of handing one remote delta to [`TextReplica::receive`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Deltas integrated by this call, including earlier ones it unblocked.
    pub applied: usize,
    /// Deltas still waiting on something this replica has not seen.
    pub held: usize,
}

struct HeldDelta {
    data: Vec<u8>,
    context: StateVector,
}

pub struct TextReplica {
    doc: Doc,
    text: TextRef,
    inbox: Mutex<Vec<HeldDelta>>,
}

impl TextReplica {
    pub fn new(text_name: &str) -> Self {
        Self::from_doc(Doc::new(), text_name)
    }

    /// Fixed client id, for deterministic tests.
    pub fn with_client_id(client_id: u64, text_name: &str) -> Self {
        let options = Options { client_id, ..Default::default() };
        Self::from_doc(Doc::with_options(options), text_name)
    }

    fn from_doc(doc: Doc, text_name: &str) -> Self {
        let text = doc.get_or_insert_text(text_name);
        Self { doc, text, inbox: Mutex::new(Vec::new()) }
    }

    pub fn content(&self) -> String {
        self.text.get_string(&self.doc.transact())
    }

    /// Length in chars.
    pub fn len(&self) -> u32 {
        to_u32(self.content().chars().count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert at a char position, clamped to the end of the text.
    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        let current = self.text.get_string(&txn);
        let at = byte_offset(&current, index);
        self.text.insert(&mut txn, at, chunk);
    }

    /// Remove `len` chars starting at `index`. Out-of-range spans are clamped.
    pub fn remove(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        let current = self.text.get_string(&txn);
        let start = byte_offset(&current, index);
        let end = byte_offset(&current, index.saturating_add(len));
        if end > start {
            self.text.remove_range(&mut txn, start, end - start);
        }
    }

    /// Clear and reinsert in one transaction. No-op when `content` is already current.
    pub fn replace(&self, content: &str) -> bool {
        if self.content() == content {
            return false;
        }
        let mut txn = self.doc.transact_mut();
        let total = self.text.len(&txn);
        if total > 0 {
            self.text.remove_range(&mut txn, 0, total);
        }
        self.text.insert(&mut txn, 0, content);
        true
    }

    /// Integrate an update immediately. Meant for complete states and diffs;
    /// relayed deltas go through [`receive`](Self::receive).
    pub fn apply_update(&self, data: &[u8], origin: &str) -> Result<(), DeltaError> {
        let update = Update::decode_v1(data).map_err(|e| DeltaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update).map_err(|e| DeltaError::Apply(e.to_string()))
    }

    /// Accept a relayed delta in causal order.
    ///
    /// `context` is the author's state vector when the delta was made (see
    /// [`UpdateNotice::context`]). Without one, the delta's own lower bound
    /// is used, which orders inserts but not deletes. The delta waits until
    /// the document covers its context, and every delta it unblocks is
    /// integrated in the same call. Duplicates are harmless.
    pub fn receive(&self, data: &[u8], context: Option<&[u8]>, origin: &str) -> Result<Delivery, DeltaError> {
        let update = Update::decode_v1(data).map_err(|e| DeltaError::Decode(e.to_string()))?;
        let context = match context {
            Some(bytes) => StateVector::decode_v1(bytes).map_err(|e| DeltaError::Decode(e.to_string()))?,
            None => update.state_vector_lower(),
        };

        let mut inbox = lock(&self.inbox);
        inbox.push(HeldDelta { data: data.to_vec(), context });
        let mut applied = 0;
        while let Some(index) = self.next_ready(&inbox) {
            let held = inbox.remove(index);
            self.apply_update(&held.data, origin)?;
            applied += 1;
        }
        Ok(Delivery { applied, held: inbox.len() })
    }

    /// Deltas waiting in the inbox.
    pub fn held(&self) -> usize {
        lock(&self.inbox).len()
    }

    /// Drop every waiting delta. Returns how many were discarded.
    pub fn clear_held(&self) -> usize {
        let mut inbox = lock(&self.inbox);
        let dropped = inbox.len();
        inbox.clear();
        dropped
    }

    fn next_ready(&self, inbox: &[HeldDelta]) -> Option<usize> {
        if inbox.is_empty() {
            return None;
        }
        let seen = self.doc.transact().state_vector();
        inbox
            .iter()
            .position(|held| held.context.iter().all(|(client, clock)| seen.get(client) >= *clock))
    }

    /// Seed text inserted as a non-user transaction.
    pub fn seed_text(&self, content: &str) {
        let mut txn = self.doc.transact_mut_with(SEED_ORIGIN);
        self.text.insert(&mut txn, 0, content);
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that a peer at `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DeltaError> {
        let sv = StateVector::decode_v1(remote_sv).map_err(|e| DeltaError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Register `callback` for every committed update.
    pub fn observe_updates<F>(&self, callback: F) -> Result<yrs::Subscription, DeltaError>
    where
        F: Fn(&UpdateNotice<'_>) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                let notice = UpdateNotice {
                    origin: txn.origin().map(|origin| origin.as_ref()),
                    update: &event.update,
                    before: txn.before_state(),
                };
                callback(&notice);
            })
            .map_err(|e| DeltaError::Apply(format!("observer registration failed: {e}")))
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

/// Byte offset of char `index` in `text`, or its end when out of range.
fn byte_offset(text: &str, index: u32) -> u32 {
    let at = text.char_indices().nth(index as usize).map_or(text.len(), |(at, _)| at);
    to_u32(at)
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
