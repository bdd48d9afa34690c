// CRDT text replicas and the delta relay that keeps them converged.

pub mod replica;
pub mod sync;

pub use replica::{Delivery, TextReplica, UpdateNotice};
pub use sync::{document_channel, CrdtSynchronizer, ReplicaPhase, Seed, SyncStats};
