//! Lock loss notification
//!
//! Loss is raised at most once per lock instance and every observer sees it,
//! including observers that subscribe after it was raised.

use crate::error::LockLost;
use tokio::sync::watch;

/// Write side, owned by the lock instance
#[derive(Debug)]
pub struct LossSignal {
    tx: watch::Sender<Option<LockLost>>,
}

impl LossSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Record the loss. Returns false if a loss was already recorded.
    pub fn notify(&self, lost: LockLost) -> bool {
        let mut lost = Some(lost);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = lost.take();
            true
        })
    }

    pub fn is_lost(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> LossReceiver {
        LossReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for LossSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a lock's loss notification
#[derive(Clone, Debug)]
pub struct LossReceiver {
    rx: watch::Receiver<Option<LockLost>>,
}

impl LossReceiver {
    /// Wait until the lock is lost. Returns `None` if the lock instance is
    /// gone without ever having been lost.
    pub async fn recv(&mut self) -> Option<LockLost> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(lost) => (*lost).clone(),
            Err(_) => None,
        }
    }

    /// The loss, if it has already happened
    pub fn current(&self) -> Option<LockLost> {
        self.rx.borrow().clone()
    }
}
