//! In-process publish/subscribe bus

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tracing::{debug, info, warn};

use weft_core::{AgentId, BusConfig, Topic, TopicPattern};
use weft_memory::{RefOrValue, ReferenceStore, Tier};

use crate::backpressure::{BackpressureSignal, TopicClass, TopicClassifier};
use crate::delivery::{Delivery, DeliveryContext, Lease};
use crate::dlq::{DeadLetterQueue, DeadLetterReason};
use crate::error::{MeshError, MeshResult};
use crate::message::{BusMessage, MessageId, OutgoingMessage};
use crate::stats::{Counter, StatsRegistry, TopicStats};
use crate::subscription::{Registry, Subscriber, Subscription, SubscriptionFilter, SubscriptionId};

/// Outcome of one publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: MessageId,
    pub sequence: u64,
    pub tier: Tier,
    pub class: TopicClass,
    /// Subscribers the message was queued for
    pub delivered: usize,
    /// Subscribers skipped because their queue stayed full
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendMode {
    Wait,
    NoWait,
}

type StreamKey = (Topic, Option<AgentId>);

/// Topic-based message bus with at-least-once delivery per subscriber.
///
/// Payloads go through the shared [`ReferenceStore`]: small ones travel
/// inline, large ones as a reference each subscriber resolves lazily.
/// Messages from one publisher on one topic are delivered in publish order
/// and carry consecutive sequence numbers.
pub struct MessageBus {
    config: BusConfig,
    classifier: TopicClassifier,
    ctx: Arc<DeliveryContext>,
    subscribers: Arc<Registry>,
    /// Sequence counter per (topic, publisher); the lock also orders sends.
    streams: DashMap<StreamKey, Arc<Mutex<u64>>>,
    closed: AtomicBool,
}

impl MessageBus {
    pub fn new(config: BusConfig, store: Arc<ReferenceStore>) -> MeshResult<Self> {
        let classifier = TopicClassifier::from_config(&config)?;
        let ctx = Arc::new(DeliveryContext {
            store,
            dlq: Arc::new(DeadLetterQueue::new(config.dead_letter.clone())),
            stats: Arc::new(StatsRegistry::default()),
            max_redeliveries: config.max_redeliveries,
        });
        debug!(
            buffer_size = config.buffer_size,
            critical_topics = ?config.critical_topics,
            "Created message bus"
        );
        Ok(Self {
            config,
            classifier,
            ctx,
            subscribers: Arc::new(DashMap::new()),
            streams: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ReferenceStore> {
        &self.ctx.store
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.ctx.dlq
    }

    pub fn classify(&self, topic: &Topic) -> TopicClass {
        self.classifier.classify(topic)
    }

    /// Resolve a message body outside of a delivery.
    pub fn resolve(&self, body: &RefOrValue) -> MeshResult<Vec<u8>> {
        Ok(self.ctx.store.get(body)?)
    }

    pub fn subscribe(&self, pattern: TopicPattern, agent: AgentId) -> MeshResult<Subscription> {
        self.subscribe_with(pattern, agent, SubscriptionFilter::default())
    }

    pub fn subscribe_with(
        &self,
        pattern: TopicPattern,
        agent: AgentId,
        filter: SubscriptionFilter,
    ) -> MeshResult<Subscription> {
        if self.is_closed() {
            return Err(MeshError::BusClosed);
        }
        let (sender, receiver) = mpsc::channel(self.config.buffer_size);
        let id = SubscriptionId::new();
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                pattern: pattern.clone(),
                agent: agent.clone(),
                filter,
                sender,
            },
        );
        debug!(subscription = %id, pattern = %pattern, agent = %agent, "Subscribed");
        Ok(Subscription::new(
            id,
            pattern,
            agent,
            receiver,
            Arc::downgrade(&self.subscribers),
        ))
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> MeshResult<()> {
        match self.subscribers.remove(id) {
            Some((_, subscriber)) => {
                debug!(subscription = %id, agent = %subscriber.agent, "Unsubscribed");
                Ok(())
            }
            None => Err(MeshError::SubscriptionNotFound(id.clone())),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publish, waiting up to the topic class's send timeout on full queues.
    pub async fn publish(&self, topic: &Topic, message: OutgoingMessage) -> MeshResult<PublishReceipt> {
        self.publish_inner(topic, message, SendMode::Wait).await
    }

    /// Publish without waiting: full queues count as timed out immediately.
    pub async fn try_publish(
        &self,
        topic: &Topic,
        message: OutgoingMessage,
    ) -> MeshResult<PublishReceipt> {
        self.publish_inner(topic, message, SendMode::NoWait).await
    }

    async fn publish_inner(
        &self,
        topic: &Topic,
        message: OutgoingMessage,
        mode: SendMode,
    ) -> MeshResult<PublishReceipt> {
        if self.is_closed() {
            return Err(MeshError::BusClosed);
        }

        let OutgoingMessage {
            from,
            message_type,
            payload,
            metadata,
        } = message;

        let store = &self.ctx.store;
        let body = store.put(&message_type, payload)?;
        // the publisher's own hold goes away when this publish returns
        let _publisher_hold = Lease::adopt(store, &body);
        let tier = body.tier();
        let class = self.classifier.classify(topic);
        let timeout = self.classifier.send_timeout(class);

        let stream = self
            .streams
            .entry((topic.clone(), from.clone()))
            .or_default()
            .clone();
        let mut sequence = stream.lock().await;
        *sequence += 1;

        let message = Arc::new(BusMessage {
            id: MessageId::new(),
            topic: topic.clone(),
            from,
            sequence: *sequence,
            message_type,
            body,
            metadata,
            published_at: Utc::now(),
        });

        let targets: Vec<(SubscriptionId, AgentId, mpsc::Sender<Delivery>)> = self
            .subscribers
            .iter()
            .filter(|s| s.pattern.matches(topic) && s.filter.accepts(&message))
            .map(|s| (s.key().clone(), s.agent.clone(), s.sender.clone()))
            .collect();

        self.ctx.stats.incr(topic, Counter::Published);
        let mut receipt = PublishReceipt {
            message_id: message.id.clone(),
            sequence: message.sequence,
            tier,
            class,
            delivered: 0,
            dropped: 0,
        };

        for (subscription, agent, sender) in targets {
            let lease = Lease::acquire(store, &message.body)?;
            let delivery = Delivery::new(
                Arc::clone(&message),
                agent.clone(),
                lease,
                Arc::clone(&self.ctx),
                sender.downgrade(),
            );

            if BackpressureSignal::from_queue(sender.max_capacity(), sender.capacity())
                == BackpressureSignal::Warning
            {
                debug!(topic = %topic, agent = %agent, free = sender.capacity(), "Subscriber queue filling up");
            }

            let undelivered = match mode {
                SendMode::Wait => match sender.send_timeout(delivery, timeout).await {
                    Ok(()) => None,
                    Err(SendTimeoutError::Timeout(d)) => Some(Some(d)),
                    Err(SendTimeoutError::Closed(_)) => Some(None),
                },
                SendMode::NoWait => match sender.try_send(delivery) {
                    Ok(()) => None,
                    Err(TrySendError::Full(d)) => Some(Some(d)),
                    Err(TrySendError::Closed(_)) => Some(None),
                },
            };

            match undelivered {
                None => receipt.delivered += 1,
                Some(None) => {
                    self.subscribers.remove(&subscription);
                    debug!(subscription = %subscription, agent = %agent, "Removed closed subscription");
                }
                Some(Some(_undelivered)) => match class {
                    TopicClass::Critical => {
                        self.ctx.stats.add(topic, Counter::Delivered, receipt.delivered as u64);
                        warn!(
                            topic = %topic,
                            agent = %agent,
                            waited = ?timeout,
                            "Critical publish failed on a full subscriber queue"
                        );
                        return Err(match mode {
                            SendMode::Wait => MeshError::Timeout {
                                topic: topic.clone(),
                                agent,
                                waited: timeout,
                            },
                            SendMode::NoWait => MeshError::QueueFull {
                                topic: topic.clone(),
                                agent,
                                capacity: sender.max_capacity(),
                            },
                        });
                    }
                    TopicClass::NonCritical => {
                        warn!(
                            topic = %topic,
                            agent = %agent,
                            message = %message.id,
                            "Subscriber queue full, dropping delivery"
                        );
                        receipt.dropped += 1;
                        self.ctx.stats.incr(topic, Counter::Dropped);
                        self.ctx
                            .dead_letter(&message, agent, DeadLetterReason::QueueFull, 1)
                            .await;
                    }
                },
            }
        }

        self.ctx
            .stats
            .add(topic, Counter::Delivered, receipt.delivered as u64);
        debug!(
            topic = %topic,
            message = %receipt.message_id,
            sequence = receipt.sequence,
            tier = ?receipt.tier,
            delivered = receipt.delivered,
            dropped = receipt.dropped,
            "Published message"
        );
        Ok(receipt)
    }

    /// Counters for one topic, with the current matching subscriber count.
    pub fn topic_stats(&self, topic: &Topic) -> TopicStats {
        let mut stats = self.ctx.stats.snapshot(topic);
        stats.active_subscribers = self
            .subscribers
            .iter()
            .filter(|s| s.pattern.matches(topic))
            .count();
        stats
    }

    /// Counters for every topic that has seen traffic.
    pub fn stats(&self) -> BTreeMap<Topic, TopicStats> {
        self.ctx
            .stats
            .topics()
            .into_iter()
            .map(|topic| {
                let stats = self.topic_stats(&topic);
                (topic, stats)
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting publishes and subscriptions. Subscribers drain what is
    /// already queued and then see the end of their stream.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.subscribers.len();
        self.subscribers.clear();
        info!(subscriptions = dropped, "Message bus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::NackOutcome;
    use std::time::Duration;
    use weft_core::CommunicationConfig;
    use weft_memory::MemoryError;

    fn store() -> Arc<ReferenceStore> {
        let mut config = CommunicationConfig::default();
        config.auto_promote.threshold_bytes = 64;
        Arc::new(ReferenceStore::new(config))
    }

    fn bus_with(config: BusConfig) -> MessageBus {
        MessageBus::new(config, store()).unwrap()
    }

    fn bus() -> MessageBus {
        bus_with(BusConfig::default())
    }

    fn agent(id: &str) -> AgentId {
        AgentId::new_unchecked(id)
    }

    fn topic(t: &str) -> Topic {
        Topic::new_unchecked(t)
    }

    fn pattern(p: &str) -> TopicPattern {
        TopicPattern::parse(p).unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_every_matching_subscriber() {
        let bus = bus();
        let mut a = bus.subscribe(pattern("debate.*"), agent("a")).unwrap();
        let mut b = bus.subscribe(pattern("debate.round"), agent("b")).unwrap();
        let mut c = bus.subscribe(pattern("swarm.*"), agent("c")).unwrap();

        let receipt = bus
            .publish(&topic("debate.round"), OutgoingMessage::text("position"))
            .await
            .unwrap();
        assert_eq!(receipt.delivered, 2);
        assert_eq!(receipt.tier, Tier::Value);

        assert_eq!(a.recv().await.unwrap().text().unwrap(), "position");
        assert_eq!(b.recv().await.unwrap().text().unwrap(), "position");
        assert!(c.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_large_payload_travels_by_reference() {
        let bus = bus();
        let mut sub = bus.subscribe(pattern("results"), agent("a")).unwrap();
        let payload = vec![b'x'; 500];

        let receipt = bus
            .publish(&topic("results"), OutgoingMessage::new(payload.clone()))
            .await
            .unwrap();
        assert_eq!(receipt.tier, Tier::Reference);

        let delivery = sub.recv().await.unwrap();
        let id = delivery.message().body.reference_id().unwrap().clone();
        // only the delivery holds it now
        assert_eq!(bus.store().metadata(&id).unwrap().ref_count, 1);
        assert_eq!(delivery.payload().unwrap(), payload);

        delivery.ack();
        assert_eq!(bus.store().metadata(&id).unwrap().ref_count, 0);
        bus.store().sweep();
        assert!(matches!(
            bus.store().resolve(&id),
            Err(MemoryError::ReferenceCollected(_))
        ));
    }

    #[tokio::test]
    async fn test_reference_without_subscribers_is_collectable() {
        let bus = bus();
        bus.publish(&topic("nobody"), OutgoingMessage::new(vec![0u8; 500]))
            .await
            .unwrap();
        assert_eq!(bus.store().sweep().collected, 1);
    }

    #[tokio::test]
    async fn test_order_per_topic_per_publisher() {
        let bus = bus();
        let mut sub = bus.subscribe(pattern("t"), agent("reader")).unwrap();

        for i in 0..10 {
            bus.publish(
                &topic("t"),
                OutgoingMessage::text(format!("{i}")).from_agent(agent("p")),
            )
            .await
            .unwrap();
        }
        bus.publish(&topic("t"), OutgoingMessage::text("other").from_agent(agent("q")))
            .await
            .unwrap();

        let mut sequences = Vec::new();
        for _ in 0..11 {
            let d = sub.recv().await.unwrap();
            if d.from() == Some(&agent("p")) {
                sequences.push((d.message().sequence, d.text().unwrap()));
            } else {
                assert_eq!(d.message().sequence, 1);
            }
        }
        let expected: Vec<(u64, String)> = (0..10).map(|i| (i as u64 + 1, i.to_string())).collect();
        assert_eq!(sequences, expected);
    }

    #[tokio::test]
    async fn test_non_critical_full_queue_drops_to_dlq() {
        let bus = bus_with(BusConfig {
            buffer_size: 1,
            non_critical: weft_core::TopicClassPolicy {
                send_timeout: Duration::from_millis(10),
            },
            ..Default::default()
        });
        let _sub = bus.subscribe(pattern("chatter"), agent("slow")).unwrap();

        let first = bus
            .publish(&topic("chatter"), OutgoingMessage::text("1"))
            .await
            .unwrap();
        assert_eq!(first.delivered, 1);
        let second = bus
            .publish(&topic("chatter"), OutgoingMessage::text("2"))
            .await
            .unwrap();
        assert_eq!(second.delivered, 0);
        assert_eq!(second.dropped, 1);

        let entries = bus.dead_letters().list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, DeadLetterReason::QueueFull);
        let stats = bus.topic_stats(&topic("chatter"));
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.active_subscribers, 1);
    }

    #[tokio::test]
    async fn test_critical_full_queue_fails_publish() {
        let bus = bus_with(BusConfig {
            buffer_size: 1,
            critical: weft_core::TopicClassPolicy {
                send_timeout: Duration::from_millis(10),
            },
            ..Default::default()
        });
        let _sub = bus.subscribe(pattern("workflow.restart"), agent("slow")).unwrap();
        let restart = topic("workflow.restart");

        bus.publish(&restart, OutgoingMessage::text("1")).await.unwrap();
        let err = bus
            .publish(&restart, OutgoingMessage::text("2"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Timeout { .. }));

        let err = bus
            .try_publish(&restart, OutgoingMessage::text("3"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::QueueFull { capacity: 1, .. }));
        assert_eq!(bus.dead_letters().size().await, 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let bus = bus_with(BusConfig {
            max_redeliveries: 2,
            ..Default::default()
        });
        let mut sub = bus.subscribe(pattern("work"), agent("w")).unwrap();
        bus.publish(&topic("work"), OutgoingMessage::new(vec![7u8; 500]))
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.attempt(), 1);
        assert_eq!(first.nack("busy").await, NackOutcome::Redelivered);

        let second = sub.recv().await.unwrap();
        assert_eq!(second.attempt(), 2);
        assert_eq!(second.payload().unwrap(), vec![7u8; 500]);
        assert_eq!(second.nack("busy").await, NackOutcome::Redelivered);

        let third = sub.recv().await.unwrap();
        assert_eq!(third.attempt(), 3);
        assert_eq!(third.nack("broken").await, NackOutcome::DeadLettered);

        let entries = bus.dead_letters().list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 3);
        // resolved inline so it outlives the reference
        assert_eq!(entries[0].message.body.tier(), Tier::Value);
        assert_eq!(bus.store().sweep().collected, 1);
        assert_eq!(bus.topic_stats(&topic("work")).redelivered, 2);
    }

    #[tokio::test]
    async fn test_filters_and_unsubscribe() {
        let bus = bus();
        let mut only_b = bus
            .subscribe_with(
                pattern("t"),
                agent("x"),
                SubscriptionFilter::from_agents([agent("b")]),
            )
            .unwrap();
        bus.publish(&topic("t"), OutgoingMessage::text("from a").from_agent(agent("a")))
            .await
            .unwrap();
        bus.publish(&topic("t"), OutgoingMessage::text("from b").from_agent(agent("b")))
            .await
            .unwrap();
        assert_eq!(only_b.recv().await.unwrap().text().unwrap(), "from b");
        assert!(only_b.try_recv().is_none());

        let id = only_b.id().clone();
        bus.unsubscribe(&id).unwrap();
        assert!(matches!(
            bus.unsubscribe(&id),
            Err(MeshError::SubscriptionNotFound(_))
        ));
        assert!(only_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let bus = bus();
        let sub = bus.subscribe(pattern("t"), agent("a")).unwrap();
        assert_eq!(bus.subscription_count(), 1);
        drop(sub);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = bus();
        let mut sub = bus.subscribe(pattern("t"), agent("a")).unwrap();
        bus.publish(&topic("t"), OutgoingMessage::text("last")).await.unwrap();
        bus.close();

        assert_eq!(sub.recv().await.unwrap().text().unwrap(), "last");
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            bus.publish(&topic("t"), OutgoingMessage::text("x")).await,
            Err(MeshError::BusClosed)
        ));
        assert!(matches!(
            bus.subscribe(pattern("t"), agent("a")),
            Err(MeshError::BusClosed)
        ));
    }

    #[test]
    fn test_invalid_critical_pattern_rejected() {
        let config = BusConfig {
            critical_topics: vec!["bad topic".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            MessageBus::new(config, store()),
            Err(MeshError::InvalidTopic(_))
        ));
    }
}
