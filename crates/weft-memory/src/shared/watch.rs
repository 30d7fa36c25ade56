//! Change notifications for shared memory keys.
//!
//! A watcher names a glob over the full key (`namespace:scope:key`, e.g.
//! `workflow:run-7:stage-*`) and receives a [`WatchEvent`] for each write,
//! deletion or expiry of a matching key. Delivery never blocks the store:
//! a watcher whose queue is full misses the event.

use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use super::{SharedKey, SharedMemoryEntry};
use crate::error::{MemoryError, MemoryResult};

/// Queue capacity of each watcher.
pub const WATCH_BUFFER: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Created or overwritten.
    Written(SharedMemoryEntry),
    Deleted(SharedKey),
    /// Removed after its TTL ran out.
    Expired(SharedKey),
}

impl WatchEvent {
    pub fn key(&self) -> &SharedKey {
        match self {
            WatchEvent::Written(entry) => &entry.key,
            WatchEvent::Deleted(key) | WatchEvent::Expired(key) => key,
        }
    }
}

struct Watcher {
    pattern: glob::Pattern,
    sender: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
pub(super) struct Watchers {
    list: Mutex<Vec<Watcher>>,
}

impl Watchers {
    pub(super) fn add(&self, pattern: &str) -> MemoryResult<mpsc::Receiver<WatchEvent>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| MemoryError::InvalidQuery(format!("invalid watch pattern '{pattern}': {e}")))?;
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Watcher { pattern, sender });
        Ok(receiver)
    }

    pub(super) fn notify(&self, event: WatchEvent) {
        let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
        if list.is_empty() {
            return;
        }
        let label = event.key().to_string();
        list.retain(|watcher| {
            if !watcher.pattern.matches(&label) {
                return !watcher.sender.is_closed();
            }
            match watcher.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(key = %label, pattern = %watcher.pattern, "Watcher queue full, event dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    pub(super) fn len(&self) -> usize {
        self.list.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
