//! Per-topic delivery counters

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use weft_core::Topic;

/// Snapshot of one topic's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
    pub redelivered: u64,
    /// Subscriptions whose pattern matches the topic right now
    pub active_subscribers: usize,
}

#[derive(Default)]
struct TopicCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
    redelivered: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Published,
    Delivered,
    Dropped,
    DeadLettered,
    Redelivered,
}

#[derive(Default)]
pub(crate) struct StatsRegistry {
    topics: DashMap<Topic, TopicCounters>,
}

impl StatsRegistry {
    pub(crate) fn incr(&self, topic: &Topic, counter: Counter) {
        self.add(topic, counter, 1);
    }

    pub(crate) fn add(&self, topic: &Topic, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        let entry = self.topics.entry(topic.clone()).or_default();
        let cell = match counter {
            Counter::Published => &entry.published,
            Counter::Delivered => &entry.delivered,
            Counter::Dropped => &entry.dropped,
            Counter::DeadLettered => &entry.dead_lettered,
            Counter::Redelivered => &entry.redelivered,
        };
        cell.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, topic: &Topic) -> TopicStats {
        self.topics
            .get(topic)
            .map(|c| TopicStats {
                published: c.published.load(Ordering::Relaxed),
                delivered: c.delivered.load(Ordering::Relaxed),
                dropped: c.dropped.load(Ordering::Relaxed),
                dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
                redelivered: c.redelivered.load(Ordering::Relaxed),
                active_subscribers: 0,
            })
            .unwrap_or_default()
    }

    pub(crate) fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.topics.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }
}
