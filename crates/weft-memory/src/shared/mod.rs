//! Shared memory for large intermediate results.
//!
//! Entries are keyed by [`SharedKey`] and written with a monotonically
//! increasing version. Payloads at or above `compression_threshold` are
//! gzip-compressed when that helps. The resident set is bounded by
//! `max_memory_bytes`; when a write would exceed it, the least recently used
//! entries move to a [`DiskOverflow`] directory. Data is never dropped to
//! make room: if neither memory nor disk can take a write, the write fails
//! with [`MemoryError::CapacityExhausted`] and the store is left unchanged.
//! Callers can [`watch`](SharedMemoryStore::watch) keys for changes.

mod codec;
mod namespace;
mod overflow;
mod query;
mod watch;

pub use namespace::{Namespace, SharedKey};
pub use overflow::DiskOverflow;
pub use query::{MAX_TOP_N, Query, SortDirection};
pub use watch::{WATCH_BUFFER, WatchEvent};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use weft_core::{AgentId, SessionId, SharedMemoryConfig};

use crate::backend::Location;
use crate::error::{MemoryError, MemoryResult};
use crate::sweeper::{SweeperHandle, spawn_sweeper};
use watch::Watchers;

/// Options for [`SharedMemoryStore::put`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Agent performing the write; checked against agent namespaces.
    pub owner: Option<AgentId>,
    /// Overrides the configured TTL.
    pub ttl: Option<Duration>,
    /// Reject the write unless the current version matches. `Some(0)` means
    /// "must not exist yet".
    pub expected_version: Option<u64>,
}

impl WriteOptions {
    pub fn owned_by(owner: AgentId) -> Self {
        Self {
            owner: Some(owner),
            ..Default::default()
        }
    }
}

/// Metadata of one entry, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMemoryEntry {
    pub key: SharedKey,
    pub owner: Option<AgentId>,
    pub version: u64,
    /// Uncompressed payload size.
    pub size_bytes: u64,
    /// Bytes actually held, after compression.
    pub stored_bytes: u64,
    pub compressed: bool,
    pub checksum: String,
    pub location: Location,
    pub disk_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SharedMemoryEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A payload read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedValue {
    pub payload: Vec<u8>,
    pub entry: SharedMemoryEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedMemoryStats {
    pub entries: usize,
    pub resident_entries: usize,
    pub resident_bytes: u64,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub spills: u64,
    pub compressions: u64,
    pub expirations: u64,
}

enum Storage {
    Resident(Vec<u8>),
    Spilled(PathBuf),
}

struct Slot {
    entry: SharedMemoryEntry,
    storage: Storage,
}

struct Inner {
    slots: HashMap<SharedKey, Slot>,
    /// Resident keys only, least recently used first.
    recency: LruCache<SharedKey, ()>,
    resident_bytes: u64,
}

#[derive(Default)]
struct Counters {
    writes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    spills: AtomicU64,
    compressions: AtomicU64,
    expirations: AtomicU64,
}

pub struct SharedMemoryStore {
    config: SharedMemoryConfig,
    overflow: Option<DiskOverflow>,
    inner: Mutex<Inner>,
    counters: Counters,
    watchers: Watchers,
}

impl SharedMemoryStore {
    pub fn new(config: SharedMemoryConfig) -> Self {
        let overflow = config
            .overflow
            .enabled
            .then(|| DiskOverflow::new(&config.overflow));
        Self {
            config,
            overflow,
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                recency: LruCache::unbounded(),
                resident_bytes: 0,
            }),
            counters: Counters::default(),
            watchers: Watchers::default(),
        }
    }

    pub fn config(&self) -> &SharedMemoryConfig {
        &self.config
    }

    /// Whether a payload of this size belongs in shared memory rather than
    /// inline in a message.
    pub fn should_store(&self, size: u64) -> bool {
        size >= self.config.threshold_bytes
    }

    /// Write into a session's namespace.
    pub async fn write(
        &self,
        session_id: &SessionId,
        key: &str,
        payload: Vec<u8>,
    ) -> MemoryResult<SharedMemoryEntry> {
        self.put(SharedKey::session(session_id, key), payload, WriteOptions::default())
            .await
    }

    /// Read from a session's namespace.
    pub async fn read(&self, session_id: &SessionId, key: &str) -> MemoryResult<Vec<u8>> {
        Ok(self.get(&SharedKey::session(session_id, key)).await?.payload)
    }

    pub async fn put(
        &self,
        key: SharedKey,
        payload: Vec<u8>,
        options: WriteOptions,
    ) -> MemoryResult<SharedMemoryEntry> {
        if let Some(owner) = &options.owner {
            key.check_access(owner)?;
        }

        let size = payload.len() as u64;
        let encoded = codec::encode(payload, self.config.compression_threshold)?;
        let stored = encoded.bytes.len() as u64;
        let label = key.to_string();

        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        // expired entries count as absent
        let current = inner
            .slots
            .get(&key)
            .filter(|slot| !slot.entry.is_expired_at(now))
            .map(|slot| (slot.entry.version, slot.entry.created_at));
        let current_version = current.map(|(v, _)| v).unwrap_or(0);
        if let Some(expected) = options.expected_version
            && expected != current_version
        {
            return Err(MemoryError::VersionConflict {
                key: label,
                expected,
                actual: current_version,
            });
        }

        let previous_resident = match inner.slots.get(&key).map(|s| &s.storage) {
            Some(Storage::Resident(bytes)) => bytes.len() as u64,
            _ => 0,
        };
        let limit = self.config.max_memory_bytes;
        let resident_without_old = inner.resident_bytes - previous_resident;

        let storage = if stored > limit {
            // never fits in memory; straight to disk
            let overflow = self.overflow_or_exhausted(stored)?;
            let path = overflow.spill(&label, &encoded.bytes).await?;
            self.counters.spills.fetch_add(1, Ordering::Relaxed);
            Storage::Spilled(path)
        } else {
            if resident_without_old + stored > limit {
                self.make_room(&mut inner, &key, resident_without_old + stored - limit)
                    .await?;
            }
            Storage::Resident(encoded.bytes)
        };

        // drop the old copy
        if let Some(old) = inner.slots.remove(&key) {
            self.discard(&mut inner, &key, old).await;
        }

        let ttl = options.ttl.unwrap_or(self.config.ttl);
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let (location, disk_path) = match &storage {
            Storage::Resident(_) => (Location::Memory, None),
            Storage::Spilled(path) => (Location::Disk, Some(path.clone())),
        };
        let entry = SharedMemoryEntry {
            key: key.clone(),
            owner: options.owner,
            version: current_version + 1,
            size_bytes: size,
            stored_bytes: stored,
            compressed: encoded.compressed,
            checksum: encoded.checksum,
            location,
            disk_path,
            created_at: current.map(|(_, c)| c).unwrap_or(now),
            updated_at: now,
            expires_at,
        };

        if matches!(storage, Storage::Resident(_)) {
            inner.resident_bytes += stored;
            inner.recency.put(key.clone(), ());
        }
        inner.slots.insert(
            key,
            Slot {
                entry: entry.clone(),
                storage,
            },
        );

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        if entry.compressed {
            self.counters.compressions.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            key = %entry.key,
            version = entry.version,
            size,
            stored,
            compressed = entry.compressed,
            location = ?entry.location,
            "Wrote shared memory entry"
        );
        self.watchers.notify(WatchEvent::Written(entry.clone()));
        Ok(entry)
    }

    pub async fn get(&self, key: &SharedKey) -> MemoryResult<SharedValue> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let Some(slot) = inner.slots.get(key) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Err(MemoryError::EntryNotFound(key.to_string()));
        };

        if slot.entry.is_expired_at(now) {
            if let Some(slot) = inner.slots.remove(key) {
                self.discard(&mut inner, key, slot).await;
            }
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.watchers.notify(WatchEvent::Expired(key.clone()));
            return Err(MemoryError::EntryExpired(key.to_string()));
        }

        let entry = slot.entry.clone();
        let bytes = match &slot.storage {
            Storage::Resident(bytes) => bytes.clone(),
            Storage::Spilled(path) => {
                let path = path.clone();
                self.load_spilled(&path).await?
            }
        };
        if entry.location == Location::Memory {
            inner.recency.promote(key);
        }
        drop(inner);

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        let payload = codec::decode(&entry.key.to_string(), bytes, entry.compressed, &entry.checksum)?;
        Ok(SharedValue { payload, entry })
    }

    /// Read on behalf of an agent, honouring agent-private namespaces.
    pub async fn get_as(&self, key: &SharedKey, agent: &AgentId) -> MemoryResult<SharedValue> {
        key.check_access(agent)?;
        self.get(key).await
    }

    /// Metadata without loading the payload.
    pub async fn entry(&self, key: &SharedKey) -> Option<SharedMemoryEntry> {
        let inner = self.inner.lock().await;
        inner
            .slots
            .get(key)
            .filter(|slot| !slot.entry.is_expired_at(Utc::now()))
            .map(|slot| slot.entry.clone())
    }

    pub async fn delete(&self, key: &SharedKey) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.slots.remove(key) {
            Some(slot) => {
                self.discard(&mut inner, key, slot).await;
                self.watchers.notify(WatchEvent::Deleted(key.clone()));
                true
            }
            None => false,
        }
    }

    /// Keys of live entries in one namespace instance, sorted.
    pub async fn list_keys(&self, namespace: Namespace, scope: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut keys: Vec<String> = inner
            .slots
            .iter()
            .filter(|(k, slot)| k.in_scope(namespace, scope) && !slot.entry.is_expired_at(now))
            .map(|(k, _)| k.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove every entry of one namespace instance. Returns how many went.
    pub async fn clear_scope(&self, namespace: Namespace, scope: &str) -> usize {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<SharedKey> = inner
            .slots
            .keys()
            .filter(|k| k.in_scope(namespace, scope))
            .cloned()
            .collect();
        for key in &doomed {
            if let Some(slot) = inner.slots.remove(key) {
                self.discard(&mut inner, key, slot).await;
                self.watchers.notify(WatchEvent::Deleted(key.clone()));
            }
        }
        if !doomed.is_empty() {
            debug!(namespace = %namespace, scope, removed = doomed.len(), "Cleared shared memory scope");
        }
        doomed.len()
    }

    pub async fn clear_session(&self, session_id: &SessionId) -> usize {
        self.clear_scope(Namespace::Session, session_id.as_str()).await
    }

    /// Remove every expired entry, in memory and on disk.
    pub async fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let expired: Vec<SharedKey> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(slot) = inner.slots.remove(key) {
                self.discard(&mut inner, key, slot).await;
                self.watchers.notify(WatchEvent::Expired(key.clone()));
            }
        }
        if !expired.is_empty() {
            self.counters
                .expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            info!(removed = expired.len(), "Expired shared memory entries");
        }
        expired.len()
    }

    /// Start periodic expiry sweeps at the configured interval.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        spawn_sweeper(
            "shared-memory-ttl",
            Arc::downgrade(self),
            self.config.sweep_interval,
            |store: Arc<Self>| async move {
                store.sweep_expired().await;
            },
        )
    }

    /// Receive an event for every write, deletion and expiry of a key whose
    /// full form (`namespace:scope:key`) matches the glob `pattern`. Events
    /// beyond [`WATCH_BUFFER`] unread ones are dropped. Dropping the
    /// receiver ends the watch.
    pub fn watch(&self, pattern: &str) -> MemoryResult<mpsc::Receiver<WatchEvent>> {
        let receiver = self.watchers.add(pattern)?;
        debug!(pattern, watchers = self.watchers.len(), "Shared memory watch added");
        Ok(receiver)
    }

    /// Run a structured query over a JSON entry.
    pub async fn query(&self, key: &SharedKey, query: &Query) -> MemoryResult<serde_json::Value> {
        query.validate()?;
        let value = self.get(key).await?;
        let data: serde_json::Value = serde_json::from_slice(&value.payload)?;
        query.run(&data)
    }

    pub async fn stats(&self) -> SharedMemoryStats {
        let inner = self.inner.lock().await;
        let disk_entries = inner
            .slots
            .values()
            .filter(|s| matches!(s.storage, Storage::Spilled(_)))
            .count();
        SharedMemoryStats {
            entries: inner.slots.len(),
            resident_entries: inner.slots.len() - disk_entries,
            resident_bytes: inner.resident_bytes,
            disk_entries,
            disk_bytes: self.overflow.as_ref().map_or(0, DiskOverflow::used_bytes),
            writes: self.counters.writes.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            spills: self.counters.spills.load(Ordering::Relaxed),
            compressions: self.counters.compressions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }

    fn overflow_or_exhausted(&self, requested: u64) -> MemoryResult<&DiskOverflow> {
        self.overflow.as_ref().ok_or(MemoryError::CapacityExhausted {
            tier: "memory",
            requested,
            limit: self.config.max_memory_bytes,
        })
    }

    /// Spill least recently used entries until `needed` bytes are freed.
    /// Fails without spilling anything if the resident set cannot free
    /// enough or overflow is disabled.
    async fn make_room(&self, inner: &mut Inner, incoming: &SharedKey, needed: u64) -> MemoryResult<()> {
        let overflow = self.overflow_or_exhausted(needed)?;

        let spillable: u64 = inner
            .slots
            .iter()
            .filter(|(k, _)| *k != incoming)
            .filter_map(|(_, s)| match &s.storage {
                Storage::Resident(bytes) => Some(bytes.len() as u64),
                Storage::Spilled(_) => None,
            })
            .sum();
        if spillable < needed {
            return Err(MemoryError::CapacityExhausted {
                tier: "memory",
                requested: needed,
                limit: self.config.max_memory_bytes,
            });
        }

        let mut freed = 0;
        let mut skipped = Vec::new();
        while freed < needed {
            let Some((victim, ())) = inner.recency.pop_lru() else {
                break;
            };
            if &victim == incoming {
                skipped.push(victim);
                continue;
            }
            let Some(slot) = inner.slots.get_mut(&victim) else {
                continue;
            };
            let Storage::Resident(bytes) = &slot.storage else {
                continue;
            };

            let label = victim.to_string();
            let size = bytes.len() as u64;
            let path = match overflow.spill(&label, bytes).await {
                Ok(path) => path,
                Err(e) => {
                    inner.recency.put(victim, ());
                    for key in skipped {
                        inner.recency.put(key, ());
                    }
                    return Err(e);
                }
            };
            slot.storage = Storage::Spilled(path.clone());
            slot.entry.location = Location::Disk;
            slot.entry.disk_path = Some(path);
            inner.resident_bytes -= size;
            freed += size;
            self.counters.spills.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, size, "Spilled least recently used entry");
        }
        for key in skipped {
            inner.recency.put(key, ());
        }
        Ok(())
    }

    async fn discard(&self, inner: &mut Inner, key: &SharedKey, slot: Slot) {
        match slot.storage {
            Storage::Resident(bytes) => {
                inner.resident_bytes -= bytes.len() as u64;
                inner.recency.pop(key);
            }
            Storage::Spilled(path) => {
                if let Some(overflow) = &self.overflow
                    && let Err(e) = overflow.remove(&path, slot.entry.stored_bytes).await
                {
                    warn!(key = %key, error = %e, "Failed to remove spilled file");
                }
            }
        }
    }

    async fn load_spilled(&self, path: &std::path::Path) -> MemoryResult<Vec<u8>> {
        match &self.overflow {
            Some(overflow) => overflow.load(path).await,
            None => Err(MemoryError::Backend(format!(
                "entry spilled to {} but overflow is disabled",
                path.display()
            ))),
        }
    }
}
