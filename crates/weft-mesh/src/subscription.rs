//! Subscriptions and their filters

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use weft_core::{AgentId, TopicPattern};

use crate::delivery::Delivery;
use crate::message::BusMessage;

/// Unique identifier of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(format!("sub-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Narrows which matching messages reach a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Only messages from these publishers; `None` accepts any.
    pub from_agents: Option<BTreeSet<AgentId>>,
    /// Every listed metadata key must be present with this value.
    pub metadata: BTreeMap<String, String>,
}

impl SubscriptionFilter {
    pub fn from_agents(agents: impl IntoIterator<Item = AgentId>) -> Self {
        Self {
            from_agents: Some(agents.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn accepts(&self, message: &BusMessage) -> bool {
        if let Some(allowed) = &self.from_agents {
            match &message.from {
                Some(from) if allowed.contains(from) => {}
                _ => return false,
            }
        }
        self.metadata
            .iter()
            .all(|(k, v)| message.metadata(k) == Some(v.as_str()))
    }
}

pub(crate) struct Subscriber {
    pub pattern: TopicPattern,
    pub agent: AgentId,
    pub filter: SubscriptionFilter,
    pub sender: mpsc::Sender<Delivery>,
}

pub(crate) type Registry = DashMap<SubscriptionId, Subscriber>;

/// Receiving end of a subscription.
///
/// Dropping it unsubscribes; deliveries still queued are released.
pub struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    agent: AgentId,
    receiver: mpsc::Receiver<Delivery>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        pattern: TopicPattern,
        agent: AgentId,
        receiver: mpsc::Receiver<Delivery>,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            id,
            pattern,
            agent,
            receiver,
            registry,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Wait for the next delivery. `None` once unsubscribed or the bus is
    /// closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Wait at most `timeout` for the next delivery.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }

    /// Take everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<Delivery> {
        std::iter::from_fn(|| self.receiver.try_recv().ok()).collect()
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade()
            && registry.remove(&self.id).is_some()
        {
            debug!(subscription = %self.id, agent = %self.agent, "Subscription dropped");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("agent", &self.agent)
            .field("pending", &self.pending())
            .finish()
    }
}
