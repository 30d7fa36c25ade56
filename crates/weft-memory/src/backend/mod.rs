//! Pluggable payload storage behind the reference store.
//!
//! The reference store only needs `put/get/delete/scan_prefix`; metadata
//! (counts, expiry) stays in the store itself.

mod file;
mod in_memory;

pub use file::FileBackend;
pub use in_memory::InMemoryBackend;

use serde::{Deserialize, Serialize};

use crate::error::MemoryResult;

/// Where a stored payload physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Memory,
    Disk,
}

/// Key/value byte storage.
pub trait PayloadBackend: Send + Sync {
    fn put(&self, key: &str, payload: &[u8]) -> MemoryResult<()>;

    fn get(&self, key: &str) -> MemoryResult<Option<Vec<u8>>>;

    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> MemoryResult<bool>;

    /// All keys starting with `prefix`, in no particular order.
    fn scan_prefix(&self, prefix: &str) -> MemoryResult<Vec<String>>;

    fn location(&self) -> Location;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
