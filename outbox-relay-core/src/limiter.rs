//! Bounded admission for event handlers.

use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// Shutdown began while waiting for a slot; the handler must not start
    #[error("admission abandoned on shutdown")]
    AbandonedOnShutdown,

    #[error("concurrency limiter closed")]
    Closed,
}

/// Counting gate that caps the number of concurrently running handlers.
///
/// Cloning shares the same slots.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    sem: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot, giving up as soon as shutdown is signaled.
    pub async fn acquire(
        &self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<AdmissionPermit, AcquireError> {
        if shutdown.is_triggered() {
            return Err(AcquireError::AbandonedOnShutdown);
        }

        tokio::select! {
            biased;

            _ = shutdown.triggered() => Err(AcquireError::AbandonedOnShutdown),

            permit = self.sem.clone().acquire_owned() => permit
                .map(|permit| AdmissionPermit { _permit: permit })
                .map_err(|_| AcquireError::Closed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots right now.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_never_admits_more_than_capacity() {
        const CAPACITY: usize = 3;
        let limiter = ConcurrencyLimiter::new(CAPACITY);
        let coordinator = ShutdownCoordinator::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..CAPACITY * 5 {
            let mut signal = coordinator.signal();
            let permit = limiter.acquire(&mut signal).await.unwrap();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(limiter.available(), CAPACITY);
    }

    #[tokio::test]
    async fn test_acquire_abandoned_on_shutdown() {
        let limiter = ConcurrencyLimiter::new(1);
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.signal();
        let _held = limiter.acquire(&mut signal).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let mut signal = coordinator.signal();
            tokio::spawn(async move { limiter.acquire(&mut signal).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.trigger();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(AcquireError::AbandonedOnShutdown));
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_fails_even_with_free_slots() {
        let limiter = ConcurrencyLimiter::new(4);
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();
        let mut signal = coordinator.signal();
        assert_eq!(
            limiter.acquire(&mut signal).await.unwrap_err(),
            AcquireError::AbandonedOnShutdown
        );
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(ConcurrencyLimiter::new(0).capacity(), 1);
    }
}
