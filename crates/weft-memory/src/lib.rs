//! # Weft Memory
//!
//! Storage for payloads exchanged between agents.
//!
//! - [`ReferenceStore`] decides per payload whether it travels inline or by
//!   reference, counts holders and garbage-collects released or expired
//!   entries. Payload bytes live in a pluggable [`PayloadBackend`].
//! - [`SharedMemoryStore`] holds larger, namespaced intermediate results with
//!   compression, checksums, TTL expiry and LRU spill-over to disk.
//!
//! Both stores can run a periodic sweep on their own timer
//! ([`ReferenceStore::spawn_gc`], [`SharedMemoryStore::spawn_sweeper`]).

pub mod backend;
pub mod error;
pub mod reference;
pub mod shared;
mod sweeper;

pub use backend::{FileBackend, InMemoryBackend, Location, PayloadBackend};
pub use error::{MemoryError, MemoryResult};
pub use reference::{
    GcReport, PutOptions, RefOrValue, Reference, ReferenceHandle, ReferenceId, ReferenceStats,
    ReferenceStore, Tier,
};
pub use shared::{
    DiskOverflow, Namespace, Query, SharedKey, SharedMemoryEntry, SharedMemoryStats,
    SharedMemoryStore, SharedValue, SortDirection, WATCH_BUFFER, WatchEvent, WriteOptions,
};
pub use sweeper::SweeperHandle;
