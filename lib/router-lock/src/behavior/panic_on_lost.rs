//! Terminates the process when a held lock is lost
//!
//! Continuing to mutate shared state after losing exclusivity is worse than
//! stopping, so the default handler exits. Callers that can degrade
//! gracefully supply their own handler or leave this behavior out and watch
//! [`Lock::lost`] instead.

use super::unlock_on_cancel::DEFAULT_UNLOCK_GRACE;
use super::Behavior;
use crate::error::LockLost;
use crate::lock::{Lock, LockHandle};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Process exit status used by the default fatal handler
pub const LOCK_LOST_EXIT_CODE: i32 = 2;

pub type FatalHandler = Arc<dyn Fn(&LockLost) + Send + Sync>;

/// On loss: best-effort unlock, then run the fatal handler exactly once
#[derive(Clone)]
pub struct PanicOnLostLock {
    grace: Duration,
    on_fatal: FatalHandler,
}

impl Default for PanicOnLostLock {
    fn default() -> Self {
        Self {
            grace: DEFAULT_UNLOCK_GRACE,
            on_fatal: Arc::new(exit_process),
        }
    }
}

impl PanicOnLostLock {
    /// Replace the fatal action, keeping the unlock-first ordering
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&LockLost) + Send + Sync + 'static,
    {
        Self {
            on_fatal: Arc::new(handler),
            ..Self::default()
        }
    }

    /// Deadline for the unlock attempted before the fatal action
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl fmt::Debug for PanicOnLostLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicOnLostLock")
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl Behavior for PanicOnLostLock {
    fn name(&self) -> &'static str {
        "panic-on-lost-lock"
    }

    fn apply(&self, mut lock: Lock) -> Lock {
        let handle = lock.handle();
        lock.spawn_watcher(self.name(), watch(handle, self.grace, self.on_fatal.clone()));
        lock
    }
}

async fn watch(lock: LockHandle, grace: Duration, on_fatal: FatalHandler) {
    let cancel = lock.cancellation();
    let mut loss = lock.lost();

    let lost = tokio::select! {
        biased;
        lost = loss.recv() => lost,
        // loss is raised before cancellation, so a lost lock is visible here
        _ = cancel.cancelled() => loss.current(),
    };
    let Some(lost) = lost else {
        return;
    };

    if let Err(e) = lock.unlock_within(grace).await {
        debug!(lock = %lock.name(), error = %e, "Unlock after loss failed");
    }
    on_fatal(&lost);
}

fn exit_process(lost: &LockLost) {
    error!(
        lock = %lost.name,
        lock_id = %lost.id,
        reason = %lost.reason,
        "Lock lost while panic-on-lost-lock is set, terminating"
    );
    std::process::exit(LOCK_LOST_EXIT_CODE);
}
