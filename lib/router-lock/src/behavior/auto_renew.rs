//! Keeps a held lease alive until the instance is torn down

use super::Behavior;
use crate::lock::{Lock, LockHandle, LockState};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

/// Renews the lease every ttl/2 once the lock is acquired. A failed renewal
/// raises the loss notification once and stops renewing.
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoRenew;

impl Behavior for AutoRenew {
    fn name(&self) -> &'static str {
        "auto-renew"
    }

    fn apply(&self, mut lock: Lock) -> Lock {
        let handle = lock.handle();
        lock.spawn_watcher(self.name(), renew_loop(handle));
        lock
    }
}

async fn renew_loop(lock: LockHandle) {
    let cancel = lock.cancellation();
    let period = lock.ttl().renew_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match lock.state().await {
            LockState::Idle => continue,
            LockState::Released => return,
            LockState::Acquired => {}
        }

        if let Err(e) = lock.renew().await {
            if cancel.is_cancelled() {
                debug!(lock = %lock.name(), error = %e, "Renewal interrupted by teardown");
                return;
            }
            error!(
                lock = %lock.name(),
                lock_id = %lock.id(),
                error = %e,
                "Lock renewal failed, lock lost"
            );
            lock.declare_lost(e.to_string());
            return;
        }
    }
}
