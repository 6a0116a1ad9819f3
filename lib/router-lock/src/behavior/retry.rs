//! Retries lock acquisition while another coordinator holds the lease

use super::Behavior;
use crate::backoff::ExponentialBackoff;
use crate::error::{LockError, Result};
use crate::lock::{Acquire, Lock, LockHandle};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Wraps `lock()` in exponential backoff for up to `budget_multiplier`
/// times the lock's ttl. Contention and transport failures are retried,
/// misuse and cancellation are returned immediately. Renewals are never
/// retried: a failed renewal is treated as loss.
#[derive(Clone, Copy, Debug)]
pub struct RetryOnContention {
    pub budget_multiplier: u32,
}

impl Default for RetryOnContention {
    fn default() -> Self {
        Self {
            budget_multiplier: 10,
        }
    }
}

impl Behavior for RetryOnContention {
    fn name(&self) -> &'static str {
        "retry-on-contention"
    }

    fn apply(&self, mut lock: Lock) -> Lock {
        let budget = lock.ttl().as_duration() * self.budget_multiplier;
        lock.wrap_acquire(|inner| Arc::new(RetryingAcquire { inner, budget }));
        lock
    }
}

struct RetryingAcquire {
    inner: Arc<dyn Acquire>,
    budget: Duration,
}

#[async_trait]
impl Acquire for RetryingAcquire {
    async fn acquire(&self, lock: &LockHandle) -> Result<()> {
        let mut backoff = ExponentialBackoff::with_max_elapsed(self.budget);
        backoff.reset();
        let cancel = lock.cancellation();

        loop {
            let err = match self.inner.acquire(lock).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }

            let Some(delay) = backoff.next_backoff() else {
                warn!(
                    lock = %lock.name(),
                    elapsed = ?backoff.elapsed(),
                    error = %err,
                    "Giving up acquiring lock"
                );
                return Err(err);
            };

            debug!(lock = %lock.name(), error = %err, ?delay, "Lock acquisition failed, retrying");
            cancel
                .run_until_cancelled(tokio::time::sleep(delay))
                .await
                .ok_or(LockError::Cancelled)?;
        }
    }
}
