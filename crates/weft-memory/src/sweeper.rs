//! Periodic background sweeps that outlive no store.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to a running sweep task.
///
/// The task stops when [`SweeperHandle::shutdown`] is called, when the handle
/// is dropped, or when the swept store itself is dropped.
pub struct SweeperHandle {
    name: &'static str,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the in-progress sweep, if any, to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(sweeper = self.name, "Sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn_sweeper<T, F, Fut>(
    name: &'static str,
    target: Weak<T>,
    interval: Duration,
    sweep: F,
) -> SweeperHandle
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(store) = target.upgrade() else {
                        debug!(sweeper = name, "Store dropped, stopping sweeper");
                        break;
                    };
                    sweep(store).await;
                }
            }
        }
    });

    SweeperHandle {
        name,
        cancel,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sweeper_ticks_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = spawn_sweeper(
            "test",
            Arc::downgrade(&counter),
            Duration::from_millis(10),
            |c: Arc<AtomicUsize>| async move {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.is_running());
        handle.shutdown().await;

        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several sweeps, saw {seen}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_target_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = spawn_sweeper(
            "test",
            Arc::downgrade(&counter),
            Duration::from_millis(5),
            |_c: Arc<AtomicUsize>| async move {},
        );
        drop(counter);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_running());
    }
}
