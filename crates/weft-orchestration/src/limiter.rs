//! Bounded concurrency shared by every agent invocation.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Fixed-capacity limiter. Every agent invocation holds one permit for
/// its whole duration; dropping the permit frees the slot, including on
/// error, panic unwinding and cancellation.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot.
#[derive(Debug)]
pub struct InvocationPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Wait for a slot. Returns `None` if `cancel` fires first or the
    /// limiter was closed.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<InvocationPermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.ok().map(|p| InvocationPermit { _permit: p })
            }
        }
    }

    /// Stop handing out permits; pending and future acquires return `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_are_released_on_drop() {
        let limiter = ConcurrencyLimiter::new(2);
        let token = CancellationToken::new();
        let a = limiter.acquire(&token).await.unwrap();
        let _b = limiter.acquire(&token).await.unwrap();
        assert_eq!(limiter.in_use(), 2);

        drop(a);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let limiter = ConcurrencyLimiter::new(1);
        let token = CancellationToken::new();
        let _held = limiter.acquire(&token).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire(&token).await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert!(waiter.await.unwrap());
        assert_eq!(limiter.in_use(), 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        limiter.close();
        assert!(limiter.acquire(&CancellationToken::new()).await.is_none());
    }
}
