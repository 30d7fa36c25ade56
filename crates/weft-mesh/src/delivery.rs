//! Deliveries handed to subscribers
//!
//! A delivery of a reference-tier message holds a lease on the stored
//! payload: the bus retains the reference before queueing the delivery and
//! the lease releases it once the delivery is acknowledged or dropped. A
//! negative acknowledgement requeues the delivery to the same subscriber up
//! to `max_redeliveries` times, after which it goes to the dead letter queue.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use weft_core::{AgentId, Topic};
use weft_memory::{RefOrValue, ReferenceId, ReferenceStore};

use crate::dlq::{DeadLetterQueue, DeadLetterReason};
use crate::error::{MeshError, MeshResult};
use crate::message::BusMessage;
use crate::stats::{Counter, StatsRegistry};

pub(crate) struct DeliveryContext {
    pub store: Arc<ReferenceStore>,
    pub dlq: Arc<DeadLetterQueue>,
    pub stats: Arc<StatsRegistry>,
    pub max_redeliveries: u32,
}

impl DeliveryContext {
    /// Dead-letter a delivery. The body is resolved inline so the entry
    /// stays readable after the reference is collected.
    pub async fn dead_letter(
        &self,
        message: &BusMessage,
        subscriber: AgentId,
        reason: DeadLetterReason,
        attempts: u32,
    ) {
        if !self.dlq.is_enabled() {
            return;
        }
        let mut message = message.clone();
        if let RefOrValue::Reference(_) = &message.body {
            match self.store.get(&message.body) {
                Ok(payload) => {
                    message.body = RefOrValue::Value {
                        message_type: message.message_type.clone(),
                        payload,
                    }
                }
                Err(e) => {
                    debug!(message = %message.id, error = %e, "Dead-lettering unresolved reference")
                }
            }
        }
        let topic = message.topic.clone();
        if self.dlq.add(message, subscriber, reason, attempts).await {
            self.stats.incr(&topic, Counter::DeadLettered);
        }
    }
}

/// One hold on a stored payload, released on drop.
pub(crate) struct Lease {
    store: Arc<ReferenceStore>,
    id: ReferenceId,
}

impl Lease {
    /// Take an additional hold for a new consumer.
    pub fn acquire(store: &Arc<ReferenceStore>, body: &RefOrValue) -> MeshResult<Option<Self>> {
        match body.reference_id() {
            Some(id) => {
                store.retain(id)?;
                Ok(Some(Self {
                    store: Arc::clone(store),
                    id: id.clone(),
                }))
            }
            None => Ok(None),
        }
    }

    /// Wrap the hold a `put` already created.
    pub fn adopt(store: &Arc<ReferenceStore>, body: &RefOrValue) -> Option<Self> {
        body.reference_id().map(|id| Self {
            store: Arc::clone(store),
            id: id.clone(),
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.store.release(&self.id) {
            warn!(reference = %self.id, error = %e, "Failed to release reference");
        }
    }
}

/// What happened to a negatively acknowledged delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Queued again for the same subscriber
    Redelivered,
    /// Moved to the dead letter queue (or dropped if it is disabled)
    DeadLettered,
}

/// A message handed to one subscriber
pub struct Delivery {
    message: Arc<BusMessage>,
    subscriber: AgentId,
    attempt: u32,
    lease: Option<Lease>,
    ctx: Arc<DeliveryContext>,
    requeue: mpsc::WeakSender<Delivery>,
}

impl Delivery {
    pub(crate) fn new(
        message: Arc<BusMessage>,
        subscriber: AgentId,
        lease: Option<Lease>,
        ctx: Arc<DeliveryContext>,
        requeue: mpsc::WeakSender<Delivery>,
    ) -> Self {
        Self {
            message,
            subscriber,
            attempt: 1,
            lease,
            ctx,
            requeue,
        }
    }

    pub fn message(&self) -> &BusMessage {
        &self.message
    }

    pub fn topic(&self) -> &Topic {
        &self.message.topic
    }

    pub fn from(&self) -> Option<&AgentId> {
        self.message.from.as_ref()
    }

    pub fn subscriber(&self) -> &AgentId {
        &self.subscriber
    }

    /// 1 for the first delivery, incremented on each redelivery
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resolve the payload, fetching it from the reference store if needed.
    pub fn payload(&self) -> MeshResult<Vec<u8>> {
        Ok(self.ctx.store.get(&self.message.body)?)
    }

    pub fn text(&self) -> MeshResult<String> {
        String::from_utf8(self.payload()?)
            .map_err(|e| MeshError::Serialization(format!("payload is not UTF-8: {e}")))
    }

    pub fn json<T: DeserializeOwned>(&self) -> MeshResult<T> {
        Ok(serde_json::from_slice(&self.payload()?)?)
    }

    /// Acknowledge processing; releases the payload hold.
    pub fn ack(self) {
        debug!(message = %self.message.id, subscriber = %self.subscriber, "Delivery acknowledged");
    }

    /// Reject the delivery for redelivery.
    pub async fn nack(self, reason: impl Into<String>) -> NackOutcome {
        let reason = reason.into();
        let Delivery {
            message,
            subscriber,
            attempt,
            mut lease,
            ctx,
            requeue,
        } = self;

        let mut dlq_reason = DeadLetterReason::RedeliveryExhausted {
            reason: reason.clone(),
        };
        if attempt <= ctx.max_redeliveries
            && let Some(sender) = requeue.upgrade()
        {
            let next = Delivery {
                message: Arc::clone(&message),
                subscriber: subscriber.clone(),
                attempt: attempt + 1,
                lease: lease.take(),
                ctx: Arc::clone(&ctx),
                requeue: requeue.clone(),
            };
            match sender.try_send(next) {
                Ok(()) => {
                    ctx.stats.incr(&message.topic, Counter::Redelivered);
                    debug!(
                        message = %message.id,
                        subscriber = %subscriber,
                        attempt = attempt + 1,
                        reason = %reason,
                        "Delivery requeued"
                    );
                    return NackOutcome::Redelivered;
                }
                Err(err) => {
                    let mut returned = err.into_inner();
                    lease = returned.lease.take();
                    dlq_reason = DeadLetterReason::QueueFull;
                }
            }
        }

        warn!(
            message = %message.id,
            topic = %message.topic,
            subscriber = %subscriber,
            attempt,
            reason = %reason,
            "Delivery rejected, dead-lettering"
        );
        ctx.dead_letter(&message, subscriber, dlq_reason, attempt).await;
        drop(lease);
        NackOutcome::DeadLettered
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message.id)
            .field("topic", &self.message.topic)
            .field("subscriber", &self.subscriber)
            .field("attempt", &self.attempt)
            .finish()
    }
}
