//! Progress feed for running workflows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use weft_core::AgentId;

use crate::pattern::PatternKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub pattern: PatternKind,
    pub message: String,
    /// Rough completion percentage, `0..=100`
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast sender for [`ProgressEvent`]s. Events sent with no subscriber
/// are discarded; slow subscribers see `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct ProgressFeed {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(
        &self,
        run_id: &str,
        pattern: PatternKind,
        progress: u8,
        agent: Option<&AgentId>,
        message: impl Into<String>,
    ) {
        let _ = self.sender.send(ProgressEvent {
            run_id: run_id.to_string(),
            pattern,
            message: message.into(),
            progress: progress.min(100),
            agent: agent.cloned(),
            timestamp: Utc::now(),
        });
    }
}

/// `done` of `total` as a percentage.
pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let feed = ProgressFeed::new(8);
        let mut rx = feed.subscribe();
        feed.emit(
            "run-1",
            PatternKind::Pipeline,
            150,
            Some(&AgentId::new_unchecked("a")),
            "stage 1 done",
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.progress, 100);
        assert_eq!(event.message, "stage 1 done");
        assert_eq!(event.agent.unwrap().as_str(), "a");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(5, 4), 100);
        assert_eq!(percent(0, 0), 100);
    }
}
