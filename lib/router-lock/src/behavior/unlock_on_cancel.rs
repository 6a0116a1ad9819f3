//! Releases a held lease when the owning scope is cancelled

use super::Behavior;
use crate::error::LockError;
use crate::lock::{Lock, LockHandle};
use std::time::Duration;
use tracing::{info, warn};

/// Deadline for a release issued after the lock's own scope has ended
pub const DEFAULT_UNLOCK_GRACE: Duration = Duration::from_secs(5);

/// When the lock's scope is cancelled while the lease is held, release it
/// under a fresh deadline of `grace`. Does nothing if the lock was never
/// acquired, is already released, or was lost.
#[derive(Clone, Copy, Debug)]
pub struct UnlockOnCancel {
    pub grace: Duration,
}

impl Default for UnlockOnCancel {
    fn default() -> Self {
        Self {
            grace: DEFAULT_UNLOCK_GRACE,
        }
    }
}

impl Behavior for UnlockOnCancel {
    fn name(&self) -> &'static str {
        "unlock-on-cancel"
    }

    fn apply(&self, mut lock: Lock) -> Lock {
        let handle = lock.handle();
        lock.spawn_watcher(self.name(), watch(handle, self.grace));
        lock
    }
}

async fn watch(lock: LockHandle, grace: Duration) {
    let cancel = lock.cancellation();
    let mut loss = lock.lost();

    tokio::select! {
        biased;
        _ = loss.recv() => return,
        _ = cancel.cancelled() => {}
    }
    if lock.is_lost() {
        return;
    }

    match lock.unlock_within(grace).await {
        Ok(()) => info!(lock = %lock.name(), lock_id = %lock.id(), "Lock released after cancellation"),
        // never acquired, or released by another path
        Err(LockError::Misuse(_)) => {}
        Err(e) => warn!(
            lock = %lock.name(),
            lock_id = %lock.id(),
            error = %e,
            "Failed to release lock after cancellation"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{AutoRenew, BehaviorSet};
    use crate::factory::test_support::{lock_with, memory_store};
    use crate::lock::LockState;
    use crate::memory::Operation;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_lock_touches_nothing() {
        let store = memory_store();
        let lock = lock_with(&store, BehaviorSet::new().with(UnlockOnCancel::default())).await;
        let provisioning_calls = store.total_calls();

        lock.handle().cancellation().cancel();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(store.total_calls(), provisioning_calls);
        assert_eq!(lock.state().await, LockState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_lock_releases_once() {
        let store = memory_store();
        let lock = lock_with(&store, BehaviorSet::new().with(UnlockOnCancel::default())).await;
        lock.lock().await.unwrap();

        lock.handle().cancellation().cancel();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(store.calls(Operation::ReleaseLease), 1);
        assert_eq!(lock.state().await, LockState::Released);
        assert!(store.holder(lock.handle().object()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_unlock_is_not_repeated() {
        let store = memory_store();
        let lock = lock_with(&store, BehaviorSet::new().with(UnlockOnCancel::default())).await;
        lock.lock().await.unwrap();
        lock.unlock().await.unwrap();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(store.calls(Operation::ReleaseLease), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_skips_release() {
        let store = memory_store();
        let behaviors = BehaviorSet::new()
            .with(AutoRenew)
            .with(UnlockOnCancel::default());
        let lock = lock_with(&store, behaviors).await;
        lock.lock().await.unwrap();
        store.fail_next(Operation::RenewLease, 1).await;

        lock.lost().recv().await.unwrap();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(store.calls(Operation::ReleaseLease), 0);
        assert_eq!(lock.state().await, LockState::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_lock_releases() {
        let store = memory_store();
        let lock = lock_with(&store, BehaviorSet::new().with(UnlockOnCancel::default())).await;
        lock.lock().await.unwrap();
        let object = lock.handle().object().clone();

        drop(lock);
        sleep(Duration::from_secs(1)).await;

        assert_eq!(store.calls(Operation::ReleaseLease), 1);
        assert!(store.holder(&object).await.is_none());
    }
}
