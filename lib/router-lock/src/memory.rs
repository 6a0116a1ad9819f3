//! In-process lease store
//!
//! Implements the same lease rules as the storage service: one holder per
//! object, leases expire after their ttl unless renewed, and only the
//! holder's id can renew or release. Every call is counted, and failures
//! can be injected per operation.

use crate::transport::{LeaseTransport, ObjectRef, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateContainer,
    CreateObject,
    AcquireLease,
    RenewLease,
    ReleaseLease,
}

impl Operation {
    const ALL: [Operation; 5] = [
        Operation::CreateContainer,
        Operation::CreateObject,
        Operation::AcquireLease,
        Operation::RenewLease,
        Operation::ReleaseLease,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
struct Lease {
    id: String,
    duration: Duration,
    expires: Instant,
}

impl Lease {
    fn is_active(&self) -> bool {
        self.expires > Instant::now()
    }
}

#[derive(Debug, Default)]
struct Store {
    containers: HashSet<String>,
    // None: object exists without a lease record
    objects: HashMap<ObjectRef, Option<Lease>>,
}

/// [`LeaseTransport`] kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    store: Mutex<Store>,
    faults: Mutex<HashMap<Operation, usize>>,
    calls: [AtomicUsize; 5],
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls made for `op`, failed ones included
    pub fn calls(&self, op: Operation) -> usize {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        Operation::ALL.iter().map(|op| self.calls(*op)).sum()
    }

    /// Make the next `count` calls of `op` fail with a 500 status
    pub async fn fail_next(&self, op: Operation, count: usize) {
        self.faults.lock().await.insert(op, count);
    }

    /// Drop the lease on `object`, as if it had been broken by an operator
    pub async fn revoke_lease(&self, object: &ObjectRef) {
        if let Some(lease) = self.store.lock().await.objects.get_mut(object) {
            *lease = None;
        }
    }

    /// Remaining lifetime of the active lease on `object`
    pub async fn lease_remaining(&self, object: &ObjectRef) -> Option<Duration> {
        let store = self.store.lock().await;
        match store.objects.get(object) {
            Some(Some(lease)) if lease.is_active() => {
                Some(lease.expires.saturating_duration_since(Instant::now()))
            }
            _ => None,
        }
    }

    pub async fn holder(&self, object: &ObjectRef) -> Option<String> {
        let store = self.store.lock().await;
        match store.objects.get(object) {
            Some(Some(lease)) if lease.is_active() => Some(lease.id.clone()),
            _ => None,
        }
    }

    async fn record(&self, op: Operation) -> Result<(), TransportError> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);

        let mut faults = self.faults.lock().await;
        if let Some(remaining) = faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Status {
                    status: 500,
                    code: Some("InternalError".to_string()),
                });
            }
        }
        Ok(())
    }
}

fn not_found(code: &str) -> TransportError {
    TransportError::Status {
        status: 404,
        code: Some(code.to_string()),
    }
}

#[async_trait]
impl LeaseTransport for MemoryLeaseStore {
    async fn create_container(&self, container: &str) -> Result<(), TransportError> {
        self.record(Operation::CreateContainer).await?;
        let mut store = self.store.lock().await;
        if !store.containers.insert(container.to_string()) {
            return Err(TransportError::AlreadyExists);
        }
        Ok(())
    }

    async fn create_object(&self, container: &str, name: &str) -> Result<(), TransportError> {
        self.record(Operation::CreateObject).await?;
        let mut store = self.store.lock().await;
        if !store.containers.contains(container) {
            return Err(not_found("ContainerNotFound"));
        }

        let object = ObjectRef::new(container, name);
        if let Some(lease) = store.objects.get(&object) {
            return Err(if lease.as_ref().is_some_and(Lease::is_active) {
                TransportError::LeaseMissing
            } else {
                TransportError::AlreadyExists
            });
        }
        store.objects.insert(object, None);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        object: &ObjectRef,
        proposed_id: &str,
        ttl_seconds: u32,
    ) -> Result<(), TransportError> {
        self.record(Operation::AcquireLease).await?;
        let mut store = self.store.lock().await;
        let slot = store
            .objects
            .get_mut(object)
            .ok_or_else(|| not_found("BlobNotFound"))?;

        if let Some(lease) = slot.as_ref() {
            if lease.is_active() && lease.id != proposed_id {
                return Err(TransportError::LeaseHeld);
            }
        }
        let duration = Duration::from_secs(u64::from(ttl_seconds));
        *slot = Some(Lease {
            id: proposed_id.to_string(),
            duration,
            expires: Instant::now() + duration,
        });
        Ok(())
    }

    async fn renew_lease(&self, object: &ObjectRef, id: &str) -> Result<(), TransportError> {
        self.record(Operation::RenewLease).await?;
        let mut store = self.store.lock().await;
        let slot = store
            .objects
            .get_mut(object)
            .ok_or_else(|| not_found("BlobNotFound"))?;

        // An expired lease can still be renewed by its holder until someone
        // else acquires the object.
        match slot.as_mut() {
            Some(lease) if lease.id == id => {
                lease.expires = Instant::now() + lease.duration;
                Ok(())
            }
            _ => Err(TransportError::LeaseLost),
        }
    }

    async fn release_lease(&self, object: &ObjectRef, id: &str) -> Result<(), TransportError> {
        self.record(Operation::ReleaseLease).await?;
        let mut store = self.store.lock().await;
        let slot = store
            .objects
            .get_mut(object)
            .ok_or_else(|| not_found("BlobNotFound"))?;

        if !matches!(slot.as_ref(), Some(lease) if lease.id == id) {
            return Err(TransportError::LeaseLost);
        }
        *slot = None;
        Ok(())
    }
}
