use std::collections::HashMap;
use std::sync::RwLock;

use super::{Location, PayloadBackend};
use crate::error::{MemoryError, MemoryResult};

/// Fast, transient payload storage using a HashMap with concurrent access.
///
/// All data is lost when the process terminates. Reads share the lock;
/// writes take it exclusively.
#[derive(Default)]
pub struct InMemoryBackend {
    store: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned(e: impl std::fmt::Display) -> MemoryError {
    MemoryError::Backend(format!("Lock poisoned: {}", e))
}

impl PayloadBackend for InMemoryBackend {
    fn put(&self, key: &str, payload: &[u8]) -> MemoryResult<()> {
        let mut store = self.store.write().map_err(poisoned)?;
        store.insert(key.to_string(), payload.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> MemoryResult<Option<Vec<u8>>> {
        let store = self.store.read().map_err(poisoned)?;
        Ok(store.get(key).cloned())
    }

    fn delete(&self, key: &str) -> MemoryResult<bool> {
        let mut store = self.store.write().map_err(poisoned)?;
        Ok(store.remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> MemoryResult<Vec<String>> {
        let store = self.store.read().map_err(poisoned)?;
        Ok(store
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn location(&self) -> Location {
        Location::Memory
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let backend = InMemoryBackend::new();
        backend.put("ref/a", b"alpha").unwrap();
        assert_eq!(backend.get("ref/a").unwrap(), Some(b"alpha".to_vec()));
        assert!(backend.delete("ref/a").unwrap());
        assert!(!backend.delete("ref/a").unwrap());
        assert_eq!(backend.get("ref/a").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix() {
        let backend = InMemoryBackend::new();
        backend.put("ref/a", b"1").unwrap();
        backend.put("ref/b", b"2").unwrap();
        backend.put("other/c", b"3").unwrap();

        let mut keys = backend.scan_prefix("ref/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ref/a", "ref/b"]);
    }
}
