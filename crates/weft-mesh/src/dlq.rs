//! Dead Letter Queue for undeliverable messages
//!
//! Deliveries that were dropped under backpressure, or negatively
//! acknowledged more times than allowed, land here with a TTL and a volume
//! limit so they can be inspected after a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use weft_core::{AgentId, DeadLetterConfig};

use crate::message::{BusMessage, MessageId};

/// Why a delivery was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The subscriber queue stayed full past the send timeout
    QueueFull,
    /// The subscriber rejected the message more than the redelivery limit
    RedeliveryExhausted { reason: String },
}

/// A message in the Dead Letter Queue with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// The original message, with its body resolved inline when possible
    pub message: BusMessage,
    /// Subscriber the delivery was meant for
    pub subscriber: AgentId,
    pub reason: DeadLetterReason,
    /// Delivery attempts made before giving up
    pub attempts: u32,
    pub added_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DlqEntry {
    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Statistics for the Dead Letter Queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlqStats {
    /// Total messages currently in DLQ
    pub current_size: usize,
    /// Total messages added to DLQ (lifetime)
    pub total_added: u64,
    /// Total messages removed from DLQ (lifetime)
    pub total_removed: u64,
    /// Total messages that expired
    pub total_expired: u64,
    /// Messages evicted because the DLQ was full
    pub total_evicted: u64,
}

/// Dead Letter Queue for failed deliveries
pub struct DeadLetterQueue {
    config: DeadLetterConfig,
    queue: RwLock<VecDeque<DlqEntry>>,
    stats: RwLock<DlqStats>,
}

impl DeadLetterQueue {
    pub fn new(config: DeadLetterConfig) -> Self {
        Self {
            config,
            queue: RwLock::new(VecDeque::new()),
            stats: RwLock::new(DlqStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Add a failed delivery. Returns whether it was kept.
    pub async fn add(
        &self,
        message: BusMessage,
        subscriber: AgentId,
        reason: DeadLetterReason,
        attempts: u32,
    ) -> bool {
        if !self.config.enabled {
            debug!(message = %message.id, "DLQ disabled, dropping failed delivery");
            return false;
        }

        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;

        if queue.len() >= self.config.max_size {
            warn!(limit = self.config.max_size, "DLQ size limit reached, dropping oldest entry");
            queue.pop_front();
            stats.total_evicted += 1;
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        debug!(
            message = %message.id,
            topic = %message.topic,
            subscriber = %subscriber,
            reason = ?reason,
            "Dead-lettered delivery"
        );
        queue.push_back(DlqEntry {
            message,
            subscriber,
            reason,
            attempts,
            added_at: now,
            expires_at: now + ttl,
        });
        stats.total_added += 1;
        stats.current_size = queue.len();
        true
    }

    /// Get all entries (for inspection)
    pub async fn list(&self) -> Vec<DlqEntry> {
        self.queue.read().await.iter().cloned().collect()
    }

    /// Remove every entry for a message. Returns how many were removed.
    pub async fn remove(&self, message_id: &MessageId) -> usize {
        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;

        let initial_len = queue.len();
        queue.retain(|entry| &entry.message.id != message_id);
        let removed = initial_len - queue.len();

        if removed > 0 {
            stats.total_removed += removed as u64;
            stats.current_size = queue.len();
            debug!(message = %message_id, "Removed message from DLQ");
        }
        removed
    }

    /// Clean up expired entries
    pub async fn cleanup_expired(&self) -> usize {
        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;

        let initial_len = queue.len();
        queue.retain(|entry| !entry.is_expired());
        let removed = initial_len - queue.len();

        if removed > 0 {
            stats.total_expired += removed as u64;
            stats.current_size = queue.len();
            debug!(removed, "Cleaned up expired DLQ entries");
        }
        removed
    }

    pub async fn stats(&self) -> DlqStats {
        self.stats.read().await.clone()
    }

    pub async fn size(&self) -> usize {
        self.queue.read().await.len()
    }

    pub async fn clear(&self) {
        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;
        let cleared = queue.len();
        queue.clear();
        stats.current_size = 0;
        debug!(cleared, "Cleared DLQ");
    }
}
