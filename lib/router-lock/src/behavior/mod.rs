//! Composable lock behaviors
//!
//! A behavior is applied once when a lock instance is built. It either
//! spawns a background task tied to the instance's cancellation scope or
//! wraps how the instance acquires its lease. Behaviors are applied in
//! order, each one seeing the instance as left by the previous ones.

mod auto_renew;
mod panic_on_lost;
mod retry;
mod unlock_on_cancel;

pub use auto_renew::AutoRenew;
pub use panic_on_lost::{FatalHandler, PanicOnLostLock, LOCK_LOST_EXIT_CODE};
pub use retry::RetryOnContention;
pub use unlock_on_cancel::UnlockOnCancel;

use crate::lock::Lock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub trait Behavior: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, lock: Lock) -> Lock;
}

/// Ordered list of behaviors applied to a new lock instance
#[derive(Clone, Default)]
pub struct BehaviorSet {
    behaviors: Vec<Arc<dyn Behavior>>,
}

impl BehaviorSet {
    /// An empty set: the lock does nothing on its own
    pub fn new() -> Self {
        Self::default()
    }

    /// Auto-renew, panic on lost lock, unlock on cancel and retry on
    /// contention, in that order
    pub fn defaults() -> Self {
        Self::new()
            .with(AutoRenew)
            .with(PanicOnLostLock::default())
            .with(UnlockOnCancel::default())
            .with(RetryOnContention::default())
    }

    pub fn with<B>(mut self, behavior: B) -> Self
    where
        B: Behavior + 'static,
    {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.behaviors.iter().map(|b| b.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    pub(crate) fn apply(&self, lock: Lock) -> Lock {
        self.behaviors.iter().fold(lock, |lock, behavior| {
            debug!(lock = %lock.name(), behavior = behavior.name(), "Applying behavior");
            behavior.apply(lock)
        })
    }
}

impl fmt::Debug for BehaviorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order() {
        assert_eq!(
            BehaviorSet::defaults().names(),
            vec!["auto-renew", "panic-on-lost-lock", "unlock-on-cancel", "retry-on-contention"]
        );
    }

    #[test]
    fn test_explicit_set() {
        let set = BehaviorSet::new().with(AutoRenew);
        assert_eq!(set.len(), 1);
        assert_eq!(format!("{:?}", set), r#"["auto-renew"]"#);
        assert!(BehaviorSet::new().is_empty());
    }
}
