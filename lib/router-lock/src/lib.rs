//! Distributed mutual exclusion on top of storage-service leases
//!
//! This library provides:
//! - Lock instances backed by a lease on a per-name blob object
//! - Pluggable behaviors: auto-renewal, retry on contention, release on
//!   cancellation and a fatal handler for lost locks
//! - A shared-key signed blob service transport and an in-memory store

pub mod backoff;
pub mod behavior;
pub mod blob;
pub mod config;
pub mod error;
pub mod factory;
pub mod lock;
pub mod memory;
pub mod name;
pub mod signal;
pub mod transport;
pub mod ttl;

pub use behavior::{
    AutoRenew, Behavior, BehaviorSet, PanicOnLostLock, RetryOnContention, UnlockOnCancel,
};
pub use blob::BlobLeaseClient;
pub use config::BlobTransportConfig;
pub use error::{ConfigError, LockError, LockLost, Misuse, Result};
pub use factory::{create_lock, LockFactory, StorageAccount};
pub use lock::{Lock, LockHandle, LockState};
pub use memory::MemoryLeaseStore;
pub use name::LockName;
pub use signal::LossReceiver;
pub use transport::{LeaseTransport, ObjectRef, TransportError};
pub use ttl::LockTtl;
