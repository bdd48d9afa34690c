// pagesync-realtime: channel multiplexing, optimistic overlays, and CRDT delta relay.

pub mod backend;
pub mod config;
pub mod connection;
pub mod crdt;
pub mod error;
pub mod multiplexer;
pub mod optimistic;
pub mod router;
pub mod scheduler;
pub mod transport;

pub use backend::MemoryBackend;
pub use config::RealtimeConfig;
pub use connection::{is_connected_state, is_error_state, ConnectionState};
pub use crdt::{CrdtSynchronizer, ReplicaPhase, Seed};
pub use error::{DeltaError, MutationError, RealtimeError, RemoteError, TransportError};
pub use multiplexer::{ChannelInfo, ChannelMultiplexer, Unsubscribe};
pub use optimistic::{Entity, OptimisticRegistry, OptimisticStore, RemoteStore};
pub use router::{ChangeFilter, ChangeHandlers, PresenceHandlers, RowChange};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use transport::{ChannelKey, ChannelSpec};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking callback poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
