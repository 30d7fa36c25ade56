//! Tiered reference store.
//!
//! `put` decides per payload whether it travels inline ([`Tier::Value`]) or
//! is stored once and passed around as a handle ([`Tier::Reference`]):
//!
//! 1. message types listed in `always_value` stay inline, whatever their size
//! 2. message types listed in `always_reference` are always stored
//! 3. otherwise payloads of at least `auto_promote.threshold_bytes` are stored
//! 4. otherwise the caller's preferred tier applies, defaulting to `Value`
//!
//! Stored entries start with a reference count of one. Consumers that keep a
//! reference beyond a single read call [`ReferenceStore::retain`]; every
//! holder eventually calls [`ReferenceStore::release`]. What happens to
//! released or expired entries depends on the store-wide [`GcStrategy`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_core::{CommunicationConfig, GcStrategy};

use crate::backend::{InMemoryBackend, Location, PayloadBackend};
use crate::error::{MemoryError, MemoryResult};
use crate::sweeper::{SweeperHandle, spawn_sweeper};

const KEY_PREFIX: &str = "ref/";

/// Identifier of a stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceId(String);

impl ReferenceId {
    /// Create a new random reference ID
    pub fn new() -> Self {
        Self(format!("ref-{}", Uuid::new_v4()))
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn backend_key(&self) -> String {
        format!("{KEY_PREFIX}{}", self.0)
    }
}

impl Default for ReferenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a payload travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Value,
    Reference,
}

/// Metadata of one stored payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub tier: Tier,
    pub message_type: String,
    pub size_bytes: u64,
    pub ref_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(with = "option_std_duration")]
    pub ttl: Option<Duration>,
    pub location: Location,
}

impl Reference {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        Some(self.created_at + ttl)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Handle carried in messages in place of a stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceHandle {
    pub id: ReferenceId,
    pub message_type: String,
    pub size_bytes: u64,
}

/// Result of [`ReferenceStore::put`]: the payload itself or a handle to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum RefOrValue {
    Value {
        message_type: String,
        #[serde(with = "base64_serde")]
        payload: Vec<u8>,
    },
    Reference(ReferenceHandle),
}

impl RefOrValue {
    pub fn tier(&self) -> Tier {
        match self {
            RefOrValue::Value { .. } => Tier::Value,
            RefOrValue::Reference(_) => Tier::Reference,
        }
    }

    pub fn message_type(&self) -> &str {
        match self {
            RefOrValue::Value { message_type, .. } => message_type,
            RefOrValue::Reference(handle) => &handle.message_type,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            RefOrValue::Value { payload, .. } => payload.len() as u64,
            RefOrValue::Reference(handle) => handle.size_bytes,
        }
    }

    pub fn reference_id(&self) -> Option<&ReferenceId> {
        match self {
            RefOrValue::Value { .. } => None,
            RefOrValue::Reference(handle) => Some(&handle.id),
        }
    }
}

/// Per-call overrides for [`ReferenceStore::put_with`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Tier the caller would like; size and policy rules take precedence.
    pub preferred_tier: Option<Tier>,
    /// Expiry for this entry; falls back to the configured default.
    pub ttl: Option<Duration>,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStats {
    pub value_puts: u64,
    pub reference_puts: u64,
    pub gets: u64,
    pub collected: u64,
    pub expired: u64,
    pub live_references: usize,
    pub live_bytes: u64,
}

/// Outcome of one GC sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcReport {
    pub examined: usize,
    pub collected: usize,
    pub expired: usize,
    pub orphans_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalReason {
    Collected,
    Expired,
}

#[derive(Default)]
struct Counters {
    value_puts: AtomicU64,
    reference_puts: AtomicU64,
    gets: AtomicU64,
    collected: AtomicU64,
    expired: AtomicU64,
}

/// Tier-aware payload store with reference counting and expiry.
///
/// Metadata lives in a sharded map so foreground `put`/`get` calls only
/// contend on the shard they touch; a GC sweep takes each shard briefly.
pub struct ReferenceStore {
    config: CommunicationConfig,
    backend: Arc<dyn PayloadBackend>,
    entries: DashMap<ReferenceId, Reference>,
    tombstones: Mutex<LruCache<ReferenceId, RemovalReason>>,
    counters: Counters,
}

impl ReferenceStore {
    /// Store backed by process memory.
    pub fn new(config: CommunicationConfig) -> Self {
        Self::with_backend(config, Arc::new(InMemoryBackend::new()))
    }

    pub fn with_backend(config: CommunicationConfig, backend: Arc<dyn PayloadBackend>) -> Self {
        let capacity =
            NonZeroUsize::new(config.tombstone_capacity).unwrap_or(NonZeroUsize::MIN);
        debug!(
            backend = backend.name(),
            strategy = ?config.gc.strategy,
            threshold = config.auto_promote.threshold_bytes,
            "Created reference store"
        );
        Self {
            config,
            backend,
            entries: DashMap::new(),
            tombstones: Mutex::new(LruCache::new(capacity)),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CommunicationConfig {
        &self.config
    }

    /// Decide the tier for a payload of `size` bytes.
    pub fn decide_tier(&self, message_type: &str, size: u64, preferred: Option<Tier>) -> Tier {
        let policies = &self.config.policies;
        if policies.always_value.iter().any(|t| t == message_type) {
            return Tier::Value;
        }
        if policies.always_reference.iter().any(|t| t == message_type) {
            return Tier::Reference;
        }
        let auto = &self.config.auto_promote;
        if auto.enabled && size >= auto.threshold_bytes {
            return Tier::Reference;
        }
        preferred.unwrap_or(Tier::Value)
    }

    pub fn put(&self, message_type: &str, payload: Vec<u8>) -> MemoryResult<RefOrValue> {
        self.put_with(message_type, payload, PutOptions::default())
    }

    pub fn put_with(
        &self,
        message_type: &str,
        payload: Vec<u8>,
        options: PutOptions,
    ) -> MemoryResult<RefOrValue> {
        let size = payload.len() as u64;
        let tier = self.decide_tier(message_type, size, options.preferred_tier);

        if tier == Tier::Value {
            self.counters.value_puts.fetch_add(1, Ordering::Relaxed);
            return Ok(RefOrValue::Value {
                message_type: message_type.to_string(),
                payload,
            });
        }

        let id = ReferenceId::new();
        let reference = Reference {
            id: id.clone(),
            tier,
            message_type: message_type.to_string(),
            size_bytes: size,
            ref_count: 1,
            created_at: Utc::now(),
            ttl: options.ttl.or(self.config.default_ttl),
            location: self.backend.location(),
        };

        // metadata first, so an orphan scan never mistakes a fresh payload for garbage
        self.entries.insert(id.clone(), reference);
        if let Err(e) = self.backend.put(&id.backend_key(), &payload) {
            self.entries.remove(&id);
            return Err(e);
        }

        self.counters.reference_puts.fetch_add(1, Ordering::Relaxed);
        debug!(reference = %id, message_type, size, "Stored payload by reference");

        Ok(RefOrValue::Reference(ReferenceHandle {
            id,
            message_type: message_type.to_string(),
            size_bytes: size,
        }))
    }

    /// Resolve a handle (or inline value) to its payload.
    pub fn get(&self, value: &RefOrValue) -> MemoryResult<Vec<u8>> {
        match value {
            RefOrValue::Value { payload, .. } => Ok(payload.clone()),
            RefOrValue::Reference(handle) => self.resolve(&handle.id),
        }
    }

    pub fn resolve(&self, id: &ReferenceId) -> MemoryResult<Vec<u8>> {
        {
            let entry = self.entries.get(id).ok_or_else(|| self.missing(id))?;
            if entry.is_expired() {
                return Err(MemoryError::ReferenceExpired(id.clone()));
            }
        }

        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        match self.backend.get(&id.backend_key())? {
            Some(payload) => Ok(payload),
            None => {
                // raced with a concurrent collection
                if self.entries.contains_key(id) {
                    Err(MemoryError::Backend(format!(
                        "payload for {id} missing from {} backend",
                        self.backend.name()
                    )))
                } else {
                    Err(self.missing(id))
                }
            }
        }
    }

    /// Metadata of a live reference.
    pub fn metadata(&self, id: &ReferenceId) -> MemoryResult<Reference> {
        self.entries
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| self.missing(id))
    }

    /// Add a holder. Returns the new count.
    pub fn retain(&self, id: &ReferenceId) -> MemoryResult<u32> {
        let mut entry = self.entries.get_mut(id).ok_or_else(|| self.missing(id))?;
        if entry.is_expired() {
            return Err(MemoryError::ReferenceExpired(id.clone()));
        }
        entry.ref_count = entry.ref_count.saturating_add(1);
        Ok(entry.ref_count)
    }

    /// Drop a holder. Returns the remaining count; at zero the entry becomes
    /// eligible for ref-counting collection.
    pub fn release(&self, id: &ReferenceId) -> MemoryResult<u32> {
        let mut entry = self.entries.get_mut(id).ok_or_else(|| self.missing(id))?;
        if entry.ref_count == 0 {
            return Err(MemoryError::ReleaseUnderflow(id.clone()));
        }
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            debug!(reference = %id, "Reference count reached zero");
        }
        Ok(entry.ref_count)
    }

    /// Remove an entry immediately, whatever its count. This is the only way
    /// entries leave a store configured with [`GcStrategy::Manual`].
    pub fn delete(&self, id: &ReferenceId) -> MemoryResult<bool> {
        if self.entries.remove(id).is_none() {
            return Ok(false);
        }
        self.backend.delete(&id.backend_key())?;
        self.tombstone(id, RemovalReason::Collected);
        Ok(true)
    }

    /// Run one GC pass with the configured strategy.
    pub fn sweep(&self) -> GcReport {
        let strategy = self.config.gc.strategy;
        let now = Utc::now();
        let mut report = GcReport::default();

        if strategy == GcStrategy::Manual {
            report.examined = self.entries.len();
            return report;
        }

        let candidates: Vec<(ReferenceId, RemovalReason)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                report.examined += 1;
                Self::removal_reason(strategy, entry.value(), now)
                    .map(|reason| (entry.key().clone(), reason))
            })
            .collect();

        for (id, reason) in candidates {
            // re-check under the shard lock; a retain may have raced the scan
            let removed = self
                .entries
                .remove_if(&id, |_, entry| {
                    Self::removal_reason(strategy, entry, now).is_some()
                })
                .is_some();
            if !removed {
                continue;
            }
            if let Err(e) = self.backend.delete(&id.backend_key()) {
                warn!(reference = %id, error = %e, "Failed to delete collected payload");
            }
            self.tombstone(&id, reason);
            match reason {
                RemovalReason::Collected => {
                    report.collected += 1;
                    self.counters.collected.fetch_add(1, Ordering::Relaxed);
                }
                RemovalReason::Expired => {
                    report.expired += 1;
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        report.orphans_removed = self.remove_orphans();

        if report.collected + report.expired + report.orphans_removed > 0 {
            info!(
                strategy = ?strategy,
                collected = report.collected,
                expired = report.expired,
                orphans = report.orphans_removed,
                "Reference GC sweep finished"
            );
        }
        report
    }

    /// Start periodic sweeps at the configured interval. Returns `None` for
    /// the manual strategy, which never collects on its own.
    pub fn spawn_gc(self: &Arc<Self>) -> Option<SweeperHandle> {
        self.spawn_gc_with(|_| {})
    }

    /// Like [`spawn_gc`](Self::spawn_gc), handing every sweep's report to
    /// `on_sweep`.
    pub fn spawn_gc_with<F>(self: &Arc<Self>, on_sweep: F) -> Option<SweeperHandle>
    where
        F: Fn(&GcReport) + Send + Sync + 'static,
    {
        if self.config.gc.strategy == GcStrategy::Manual {
            return None;
        }
        let on_sweep = Arc::new(on_sweep);
        Some(spawn_sweeper(
            "reference-gc",
            Arc::downgrade(self),
            self.config.gc.interval,
            move |store: Arc<Self>| {
                let on_sweep = Arc::clone(&on_sweep);
                async move {
                    let report = store.sweep();
                    on_sweep(&report);
                }
            },
        ))
    }

    pub fn stats(&self) -> ReferenceStats {
        let live_bytes = self.entries.iter().map(|e| e.size_bytes).sum();
        ReferenceStats {
            value_puts: self.counters.value_puts.load(Ordering::Relaxed),
            reference_puts: self.counters.reference_puts.load(Ordering::Relaxed),
            gets: self.counters.gets.load(Ordering::Relaxed),
            collected: self.counters.collected.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            live_references: self.entries.len(),
            live_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn removal_reason(
        strategy: GcStrategy,
        entry: &Reference,
        now: DateTime<Utc>,
    ) -> Option<RemovalReason> {
        match strategy {
            GcStrategy::RefCounting if entry.ref_count == 0 => Some(RemovalReason::Collected),
            GcStrategy::Ttl if entry.is_expired_at(now) => Some(RemovalReason::Expired),
            _ => None,
        }
    }

    fn remove_orphans(&self) -> usize {
        let keys = match self.backend.scan_prefix(KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to scan backend for orphaned payloads");
                return 0;
            }
        };

        keys.into_iter()
            .filter_map(|key| key.strip_prefix(KEY_PREFIX).map(ReferenceId::from_string))
            .filter(|id| !self.entries.contains_key(id))
            .filter(|id| self.backend.delete(&id.backend_key()).unwrap_or(false))
            .count()
    }

    fn tombstone(&self, id: &ReferenceId, reason: RemovalReason) {
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.put(id.clone(), reason);
        }
    }

    fn missing(&self, id: &ReferenceId) -> MemoryError {
        let reason = self
            .tombstones
            .lock()
            .ok()
            .and_then(|mut t| t.get(id).copied());
        match reason {
            Some(RemovalReason::Collected) => MemoryError::ReferenceCollected(id.clone()),
            Some(RemovalReason::Expired) => MemoryError::ReferenceExpired(id.clone()),
            None => MemoryError::ReferenceNotFound(id.clone()),
        }
    }
}

mod base64_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            bytes,
        ))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
            .map_err(serde::de::Error::custom)
    }
}

mod option_std_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
