// pagesync-common: shared record, presence, and wire types for the pagesync workspace

pub mod crdt;
pub mod presence;
pub mod protocol;
pub mod types;
