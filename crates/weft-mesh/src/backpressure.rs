//! Topic classes and bounded send waits
//!
//! Every topic is either critical or non-critical. A publish to a full
//! subscriber queue waits up to the class's send timeout; after that a
//! critical publish fails while a non-critical one drops the delivery
//! (logged, and dead-lettered when the DLQ is enabled).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use weft_core::{BusConfig, Topic, TopicPattern};

use crate::error::MeshResult;

/// Delivery class of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicClass {
    /// Must not be dropped; publish fails instead (restart coordination)
    Critical,
    /// May be dropped with a warning under pressure
    NonCritical,
}

/// Fill level of a subscriber queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureSignal {
    /// Below three quarters full
    Normal,
    /// Approaching capacity
    Warning,
    /// No free slots
    Critical,
}

impl BackpressureSignal {
    /// Classify a queue from its capacity and free slots.
    pub fn from_queue(capacity: usize, free: usize) -> Self {
        if free == 0 {
            BackpressureSignal::Critical
        } else if (capacity - free.min(capacity)) * 4 >= capacity * 3 {
            BackpressureSignal::Warning
        } else {
            BackpressureSignal::Normal
        }
    }
}

/// Maps topics to classes and classes to send timeouts
#[derive(Debug, Clone)]
pub struct TopicClassifier {
    critical: Vec<TopicPattern>,
    critical_timeout: Duration,
    non_critical_timeout: Duration,
}

impl TopicClassifier {
    pub fn from_config(config: &BusConfig) -> MeshResult<Self> {
        let critical = config
            .critical_topics
            .iter()
            .map(TopicPattern::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            critical,
            critical_timeout: config.critical.send_timeout,
            non_critical_timeout: config.non_critical.send_timeout,
        })
    }

    pub fn classify(&self, topic: &Topic) -> TopicClass {
        if self.critical.iter().any(|p| p.matches(topic)) {
            TopicClass::Critical
        } else {
            TopicClass::NonCritical
        }
    }

    pub fn send_timeout(&self, class: TopicClass) -> Duration {
        match class {
            TopicClass::Critical => self.critical_timeout,
            TopicClass::NonCritical => self.non_critical_timeout,
        }
    }
}
