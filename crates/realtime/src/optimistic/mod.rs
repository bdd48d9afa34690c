// Optimistic mutation overlay: local edits shown before the server confirms them.

pub mod entity;
pub mod mutation;
pub mod registry;
pub mod store;

pub use entity::{Entity, MatchKey, Patch};
pub use mutation::RemoteStore;
pub use registry::OptimisticRegistry;
pub use store::{EntryInfo, MutationKind, MutationNotice, OptimisticStore, OverlaySummary};
