//! # Weft Mesh
//!
//! Topic-based publish/subscribe between agents of a running workflow.
//!
//! Publishers hand the bus an [`OutgoingMessage`]; its payload is stored in
//! the shared [`ReferenceStore`](weft_memory::ReferenceStore), so large
//! payloads reach every subscriber as one reference instead of one copy per
//! subscriber. Each subscriber owns a bounded queue of [`Delivery`] values:
//!
//! - critical topics (restart coordination) fail the publish rather than drop
//! - non-critical topics drop under sustained pressure and dead-letter the
//!   delivery
//! - a negatively acknowledged delivery is redelivered a bounded number of
//!   times before it is dead-lettered
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft_core::{AgentId, BusConfig, CommunicationConfig, Topic, TopicPattern};
//! use weft_memory::ReferenceStore;
//! use weft_mesh::{MessageBus, OutgoingMessage};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(ReferenceStore::new(CommunicationConfig::default()));
//! let bus = MessageBus::new(BusConfig::default(), store)?;
//!
//! let mut inbox = bus.subscribe(TopicPattern::parse("debate.*")?, AgentId::parse("critic")?)?;
//! bus.publish(&Topic::parse("debate.round1")?, OutgoingMessage::text("opening")).await?;
//!
//! if let Some(delivery) = inbox.recv().await {
//!     println!("{}", delivery.text()?);
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod bus;
pub mod delivery;
pub mod dlq;
pub mod error;
pub mod message;
pub mod stats;
pub mod subscription;

pub use backpressure::{BackpressureSignal, TopicClass, TopicClassifier};
pub use bus::{MessageBus, PublishReceipt};
pub use delivery::{Delivery, NackOutcome};
pub use dlq::{DeadLetterQueue, DeadLetterReason, DlqEntry, DlqStats};
pub use error::{MeshError, MeshResult};
pub use message::{BusMessage, DEFAULT_MESSAGE_TYPE, MessageId, OutgoingMessage};
pub use stats::TopicStats;
pub use subscription::{Subscription, SubscriptionFilter, SubscriptionId};
