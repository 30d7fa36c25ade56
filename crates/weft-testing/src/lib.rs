//! # Weft Testing
//!
//! Deterministic stand-ins for the external capabilities Weft consumes:
//!
//! - [`ScriptedAgent`]: canned, sequenced or computed replies, usage
//!   reporting, scripted tool calls and a timestamped call log
//! - [`FailingAgent`]: every turn fails
//! - [`SlowAgent`]: replies after a delay and tracks peak concurrency
//! - [`StaticJudge`]: fixed or computed verdicts
//!
//! ```rust
//! use std::sync::Arc;
//! use weft_core::{Agent, SessionId};
//! use weft_testing::ScriptedAgent;
//!
//! # tokio_test::block_on(async {
//! let agent = Arc::new(ScriptedAgent::sequence(["first", "second"]));
//! let session = SessionId::new("s1").unwrap();
//! assert_eq!(agent.chat(&session, "hi").await.unwrap().content, "first");
//! assert_eq!(agent.chat(&session, "hi").await.unwrap().content, "second");
//! assert_eq!(agent.chat(&session, "hi").await.unwrap().content, "second");
//! assert_eq!(agent.call_count(), 3);
//! # });
//! ```

pub mod agents;
pub mod judge;

pub use agents::{FailingAgent, RecordedCall, ScriptedAgent, SlowAgent};
pub use judge::StaticJudge;
