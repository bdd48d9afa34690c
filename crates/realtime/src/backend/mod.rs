// Backends the realtime layer can run against.

pub mod memory;

pub use memory::MemoryBackend;
