use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("concurrency limiter is closed")]
pub struct LimiterClosed;

/// Process-wide admission gate for outbound network operations.
///
/// Waiters are admitted in arrival order. There is no timeout here; a task
/// holds its slot until it finishes.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Run `task` once a slot is free.
    pub async fn admit<F, Fut, T, E>(&self, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LimiterClosed>,
    {
        let _permit = self.semaphore.acquire().await.map_err(|_| LimiterClosed)?;
        task().await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Reject current waiters and all future admissions. Running tasks keep their slots.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
