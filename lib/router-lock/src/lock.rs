//! Lock instance state machine
//!
//! A [`Lock`] moves through `Idle -> Acquired -> Released` exactly once.
//! Every state change and every lease call runs inside one critical
//! section, so the owner and the behavior tasks never interleave a lock,
//! renew or unlock. Calls from a state that doesn't allow them fail with
//! [`Misuse`] instead of silently doing nothing.

use crate::error::{LockError, LockLost, Misuse, Result};
use crate::name::LockName;
use crate::signal::{LossReceiver, LossSignal};
use crate::transport::{LeaseTransport, ObjectRef, TransportError};
use crate::ttl::LockTtl;
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquired,
    /// Terminal: a new instance is needed to take the lock again
    Released,
}

struct LockCore {
    name: LockName,
    ttl: LockTtl,
    id: Uuid,
    lease_id: String,
    object: ObjectRef,
    transport: Arc<dyn LeaseTransport>,
    state: Mutex<LockState>,
    cancel: CancellationToken,
    lost: LossSignal,
}

/// Shared access to a lock instance for behavior tasks
#[derive(Clone)]
pub struct LockHandle {
    core: Arc<LockCore>,
}

impl LockHandle {
    pub(crate) fn new(
        name: LockName,
        ttl: LockTtl,
        object: ObjectRef,
        transport: Arc<dyn LeaseTransport>,
        cancel: CancellationToken,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            core: Arc::new(LockCore {
                name,
                ttl,
                id,
                lease_id: id.to_string(),
                object,
                transport,
                state: Mutex::new(LockState::Idle),
                cancel,
                lost: LossSignal::new(),
            }),
        }
    }

    pub fn name(&self) -> &LockName {
        &self.core.name
    }

    pub fn ttl(&self) -> LockTtl {
        self.core.ttl
    }

    /// Lease holder token used for every lease call of this instance
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn object(&self) -> &ObjectRef {
        &self.core.object
    }

    pub async fn state(&self) -> LockState {
        *self.core.state.lock().await
    }

    /// The instance's cancellation scope; cancelled by any unlock path
    pub fn cancellation(&self) -> CancellationToken {
        self.core.cancel.clone()
    }

    pub fn lost(&self) -> LossReceiver {
        self.core.lost.subscribe()
    }

    pub fn is_lost(&self) -> bool {
        self.core.lost.is_lost()
    }

    /// One acquisition attempt, without any retry behavior.
    ///
    /// Cancellation abandons an in-flight acquire call. If the service had
    /// already granted the lease, the instance stays `Idle` and nothing
    /// releases it: the lease expires after one ttl.
    pub async fn acquire_once(&self) -> Result<()> {
        let core = &self.core;
        let mut state = core.state.lock().await;
        match *state {
            LockState::Acquired => return Err(Misuse::AlreadyAcquired.into()),
            LockState::Released => return Err(Misuse::Released.into()),
            LockState::Idle => {}
        }
        if core.cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        core.cancel
            .run_until_cancelled(core.transport.acquire_lease(
                &core.object,
                &core.lease_id,
                core.ttl.lease_seconds(),
            ))
            .await
            .ok_or(LockError::Cancelled)?
            .map_err(|e| self.classify(e))?;

        *state = LockState::Acquired;
        info!(lock = %core.name, lock_id = %core.id, ttl = ?core.ttl.as_duration(), "Lock acquired");
        Ok(())
    }

    /// Extend the held lease by another ttl
    pub async fn renew(&self) -> Result<()> {
        let core = &self.core;
        let state = core.state.lock().await;
        match *state {
            LockState::Idle => return Err(Misuse::NotAcquired.into()),
            LockState::Released => return Err(Misuse::Released.into()),
            LockState::Acquired => {}
        }
        if core.cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        core.cancel
            .run_until_cancelled(core.transport.renew_lease(&core.object, &core.lease_id))
            .await
            .ok_or(LockError::Cancelled)?
            .map_err(|e| self.classify(e))?;

        debug!(lock = %core.name, lock_id = %core.id, "Lock renewed");
        Ok(())
    }

    /// Release the lease, waiting at most one ttl for the storage service
    pub async fn unlock(&self) -> Result<()> {
        self.release(self.core.ttl.as_duration()).await
    }

    /// Release the lease with its own deadline. Works after the instance's
    /// cancellation scope has already been cancelled.
    pub async fn unlock_within(&self, deadline: Duration) -> Result<()> {
        self.release(deadline).await
    }

    async fn release(&self, deadline: Duration) -> Result<()> {
        let core = &self.core;
        let mut state = core.state.lock().await;
        match *state {
            LockState::Idle => return Err(Misuse::NotAcquired.into()),
            LockState::Released => return Err(Misuse::Released.into()),
            LockState::Acquired => {}
        }
        *state = LockState::Released;

        let result = match tokio::time::timeout(
            deadline,
            core.transport.release_lease(&core.object, &core.lease_id),
        )
        .await
        {
            Ok(result) => result.map_err(|e| self.classify(e)),
            Err(_) => Err(LockError::Transport(TransportError::Timeout)),
        };

        core.cancel.cancel();

        match &result {
            Ok(()) => info!(lock = %core.name, lock_id = %core.id, "Lock released"),
            Err(e) => warn!(
                lock = %core.name,
                lock_id = %core.id,
                error = %e,
                "Lock release failed, lease expires after its ttl"
            ),
        }
        result
    }

    /// Raise the loss notification, then cancel the instance scope.
    /// Observers that wake on cancellation can therefore always tell a loss
    /// from a normal teardown.
    pub(crate) fn declare_lost(&self, reason: String) -> bool {
        let first = self.core.lost.notify(LockLost {
            name: self.core.name.to_string(),
            id: self.core.id,
            reason,
        });
        self.core.cancel.cancel();
        first
    }

    fn classify(&self, err: TransportError) -> LockError {
        match err {
            TransportError::LeaseHeld => LockError::Contention {
                name: self.core.name.to_string(),
            },
            other => LockError::Transport(other),
        }
    }
}

/// Strategy used by [`Lock::lock`]; behaviors may wrap it
#[async_trait]
pub trait Acquire: Send + Sync {
    async fn acquire(&self, lock: &LockHandle) -> Result<()>;
}

struct DirectAcquire;

#[async_trait]
impl Acquire for DirectAcquire {
    async fn acquire(&self, lock: &LockHandle) -> Result<()> {
        lock.acquire_once().await
    }
}

struct Watcher {
    behavior: &'static str,
    task: JoinHandle<()>,
}

/// A named distributed lock backed by a storage lease.
///
/// Dropping the lock cancels its scope, which stops every behavior task
/// (and lets `UnlockOnCancel` release a held lease).
pub struct Lock {
    handle: LockHandle,
    acquire: Arc<dyn Acquire>,
    watchers: Vec<Watcher>,
}

impl Lock {
    pub(crate) fn new(handle: LockHandle) -> Self {
        Self {
            handle,
            acquire: Arc::new(DirectAcquire),
            watchers: Vec::new(),
        }
    }

    /// Take the lock. Valid only once, from `Idle`.
    pub async fn lock(&self) -> Result<()> {
        self.acquire.acquire(&self.handle).await
    }

    /// Extend the lease. Valid only while `Acquired`.
    pub async fn renew(&self) -> Result<()> {
        self.handle.renew().await
    }

    /// Release the lease and stop all behavior tasks. Valid only while
    /// `Acquired`; the instance is `Released` afterwards even if the
    /// storage call failed.
    pub async fn unlock(&self) -> Result<()> {
        self.handle.unlock().await
    }

    pub fn id(&self) -> Uuid {
        self.handle.id()
    }

    pub fn name(&self) -> &LockName {
        self.handle.name()
    }

    pub fn ttl(&self) -> LockTtl {
        self.handle.ttl()
    }

    pub async fn state(&self) -> LockState {
        self.handle.state().await
    }

    /// Notified once if the lease is lost after being acquired
    pub fn lost(&self) -> LossReceiver {
        self.handle.lost()
    }

    pub fn handle(&self) -> LockHandle {
        self.handle.clone()
    }

    /// Replace the acquisition strategy with a wrapper around the current one
    pub fn wrap_acquire<F>(&mut self, wrap: F)
    where
        F: FnOnce(Arc<dyn Acquire>) -> Arc<dyn Acquire>,
    {
        self.acquire = wrap(self.acquire.clone());
    }

    /// Run a behavior's background task for the lifetime of this instance
    pub fn spawn_watcher<F>(&mut self, behavior: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(lock = %self.handle.name(), behavior, "Starting behavior task");
        self.watchers.push(Watcher {
            behavior,
            task: tokio::spawn(task),
        });
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Take the lock, run `work`, release the lock.
    ///
    /// If the lock is lost while `work` runs, `work` is dropped and
    /// [`LockError::Lost`] is returned.
    pub async fn run_exclusive<F>(&self, work: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.lock().await?;

        let mut loss = self.lost();
        let outcome = tokio::select! {
            biased;
            Some(lost) = loss.recv() => Err(LockError::Lost(lost)),
            output = work => Ok(output),
        };

        match outcome {
            Ok(output) => {
                self.unlock().await?;
                Ok(output)
            }
            Err(e) => {
                if let Err(unlock_err) = self.unlock().await {
                    debug!(lock = %self.handle.name(), error = %unlock_err, "Unlock after loss failed");
                }
                Err(e)
            }
        }
    }

    /// Release the lock if still held, stop every behavior task and wait for
    /// them to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        let result = match self.handle.unlock().await {
            Err(LockError::Misuse(Misuse::NotAcquired | Misuse::Released)) => Ok(()),
            other => other,
        };
        self.handle.core.cancel.cancel();

        let watchers = std::mem::take(&mut self.watchers);
        let behaviors: Vec<_> = watchers.iter().map(|w| w.behavior).collect();
        let joined = join_all(watchers.into_iter().map(|w| w.task)).await;
        for (behavior, outcome) in behaviors.into_iter().zip(joined) {
            if let Err(e) = outcome {
                warn!(lock = %self.handle.name(), behavior, error = %e, "Behavior task failed");
            }
        }
        result
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.handle.core.cancel.cancel();
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.handle.name().as_str())
            .field("id", &self.handle.id())
            .field("ttl", &self.handle.ttl().as_duration())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryLeaseStore, Operation};
    use crate::transport::LOCK_CONTAINER;
    use tokio::time::sleep;

    /// Grants leases through the memory store, then stalls before answering
    struct StallingAcquire {
        store: Arc<MemoryLeaseStore>,
        stall: Duration,
    }

    #[async_trait]
    impl LeaseTransport for StallingAcquire {
        async fn create_container(&self, container: &str) -> std::result::Result<(), TransportError> {
            self.store.create_container(container).await
        }

        async fn create_object(&self, container: &str, name: &str) -> std::result::Result<(), TransportError> {
            self.store.create_object(container, name).await
        }

        async fn acquire_lease(
            &self,
            object: &ObjectRef,
            proposed_id: &str,
            ttl_seconds: u32,
        ) -> std::result::Result<(), TransportError> {
            self.store.acquire_lease(object, proposed_id, ttl_seconds).await?;
            sleep(self.stall).await;
            Ok(())
        }

        async fn renew_lease(&self, object: &ObjectRef, id: &str) -> std::result::Result<(), TransportError> {
            self.store.renew_lease(object, id).await
        }

        async fn release_lease(&self, object: &ObjectRef, id: &str) -> std::result::Result<(), TransportError> {
            self.store.release_lease(object, id).await
        }
    }

    fn bare_lock(store: &Arc<MemoryLeaseStore>, name: &str) -> Lock {
        let name = LockName::parse(name).unwrap();
        let object = ObjectRef::new(LOCK_CONTAINER, name.object_name());
        Lock::new(LockHandle::new(
            name,
            LockTtl::from_secs(15).unwrap(),
            object,
            store.clone(),
            CancellationToken::new(),
        ))
    }

    async fn provisioned(name: &str) -> Arc<MemoryLeaseStore> {
        let store = Arc::new(MemoryLeaseStore::new());
        store.create_container(LOCK_CONTAINER).await.unwrap();
        store
            .create_object(LOCK_CONTAINER, &format!("azlk-{}", name))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");

        assert_eq!(lock.state().await, LockState::Idle);
        lock.lock().await.unwrap();
        assert_eq!(lock.state().await, LockState::Acquired);
        lock.renew().await.unwrap();
        assert_eq!(lock.state().await, LockState::Acquired);
        lock.unlock().await.unwrap();
        assert_eq!(lock.state().await, LockState::Released);
        assert!(lock.handle().cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_double_lock_issues_single_acquire() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");

        lock.lock().await.unwrap();
        let err = lock.lock().await.unwrap_err();
        assert!(matches!(err, LockError::Misuse(Misuse::AlreadyAcquired)));
        assert_eq!(store.calls(Operation::AcquireLease), 1);
    }

    #[tokio::test]
    async fn test_unlock_requires_acquired() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");

        let err = lock.unlock().await.unwrap_err();
        assert!(matches!(err, LockError::Misuse(Misuse::NotAcquired)));
        assert_eq!(lock.state().await, LockState::Idle);

        lock.lock().await.unwrap();
        lock.unlock().await.unwrap();
        let err = lock.unlock().await.unwrap_err();
        assert!(matches!(err, LockError::Misuse(Misuse::Released)));
        assert_eq!(store.calls(Operation::ReleaseLease), 1);
    }

    #[tokio::test]
    async fn test_released_instance_is_not_reusable() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");

        lock.lock().await.unwrap();
        lock.unlock().await.unwrap();

        assert!(matches!(lock.lock().await, Err(LockError::Misuse(Misuse::Released))));
        assert!(matches!(lock.renew().await, Err(LockError::Misuse(Misuse::Released))));
        assert_eq!(store.calls(Operation::AcquireLease), 1);
        assert_eq!(store.calls(Operation::RenewLease), 0);
    }

    #[tokio::test]
    async fn test_renew_requires_acquired() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");

        assert!(matches!(lock.renew().await, Err(LockError::Misuse(Misuse::NotAcquired))));
        assert_eq!(store.calls(Operation::RenewLease), 0);
    }

    #[tokio::test]
    async fn test_contention_is_classified() {
        let store = provisioned("svc-a").await;
        let first = bare_lock(&store, "svc-a");
        let second = bare_lock(&store, "svc-a");

        first.lock().await.unwrap();
        let err = second.lock().await.unwrap_err();
        assert!(matches!(err, LockError::Contention { ref name } if name == "svc-a"));
        assert!(err.is_retryable());
        assert_eq!(second.state().await, LockState::Idle);
    }

    #[tokio::test]
    async fn test_failed_release_still_terminates() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");

        lock.lock().await.unwrap();
        store.fail_next(Operation::ReleaseLease, 1).await;

        assert!(matches!(lock.unlock().await, Err(LockError::Transport(_))));
        assert_eq!(lock.state().await, LockState::Released);
        assert!(lock.handle().cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_scope_blocks_acquire() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");

        lock.handle().cancellation().cancel();
        assert!(matches!(lock.lock().await, Err(LockError::Cancelled)));
        assert_eq!(store.calls(Operation::AcquireLease), 0);
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_after_work() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");

        let value = lock.run_exclusive(async { 42 }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(lock.state().await, LockState::Released);
        assert_eq!(store.calls(Operation::ReleaseLease), 1);
    }

    #[tokio::test]
    async fn test_run_exclusive_aborts_work_on_loss() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");
        let handle = lock.handle();

        let work = async move {
            handle.declare_lost("lease expired".to_string());
            std::future::pending::<()>().await;
        };
        let err = lock.run_exclusive(work).await.unwrap_err();
        assert!(matches!(err, LockError::Lost(ref lost) if lost.reason == "lease expired"));
    }

    #[tokio::test]
    async fn test_shutdown_joins_watchers() {
        let store = provisioned("svc-a").await;
        let mut lock = bare_lock(&store, "svc-a");

        let cancel = lock.handle().cancellation();
        lock.spawn_watcher("test", async move { cancel.cancelled().await });
        assert_eq!(lock.watcher_count(), 1);

        lock.lock().await.unwrap();
        lock.shutdown().await.unwrap();
        assert_eq!(store.calls(Operation::ReleaseLease), 1);
    }

    #[tokio::test]
    async fn test_debug_shows_identity() {
        let store = provisioned("svc-a").await;
        let lock = bare_lock(&store, "svc-a");

        let debug = format!("{:?}", lock);
        assert!(debug.starts_with("Lock {"));
        assert!(debug.contains("\"svc-a\""));
        assert!(debug.contains(&lock.id().to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_acquire_leaves_lease_to_expire() {
        let store = provisioned("svc-a").await;
        let name = LockName::parse("svc-a").unwrap();
        let object = ObjectRef::new(LOCK_CONTAINER, name.object_name());
        let transport = Arc::new(StallingAcquire {
            store: store.clone(),
            stall: Duration::from_secs(10),
        });
        let lock = Lock::new(LockHandle::new(
            name,
            LockTtl::from_secs(15).unwrap(),
            object.clone(),
            transport,
            CancellationToken::new(),
        ));

        let cancel = lock.handle().cancellation();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        assert!(matches!(lock.lock().await, Err(LockError::Cancelled)));
        assert_eq!(lock.state().await, LockState::Idle);
        assert_eq!(store.holder(&object).await, Some(lock.id().to_string()));

        sleep(Duration::from_secs(15)).await;
        assert!(store.holder(&object).await.is_none());
    }
}
