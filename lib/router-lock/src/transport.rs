//! Lease transport contract
//!
//! The lock only needs five calls from the storage service. Exclusivity is
//! enforced entirely by the service: a lease taken under one id cannot be
//! acquired, renewed or released under another.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Container shared by every lock in a storage account
pub const LOCK_CONTAINER: &str = "azlockcontainer";

/// Location of a lease-able object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub container: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Resource already exists")]
    AlreadyExists,

    /// The object exists and carries an active lease
    #[error("Object exists with an active lease")]
    LeaseMissing,

    #[error("Lease is held by another owner")]
    LeaseHeld,

    #[error("Lease is not held under the given id")]
    LeaseLost,

    #[error("Storage request failed with status {status}: {}", .code.as_deref().unwrap_or("no error code"))]
    Status { status: u16, code: Option<String> },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage request timed out")]
    Timeout,
}

impl TransportError {
    /// Failures worth repeating the same request for
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TransportError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

/// Container and object lease operations of the storage service
#[async_trait]
pub trait LeaseTransport: Send + Sync + 'static {
    /// Create a container. `AlreadyExists` if it is present.
    async fn create_container(&self, container: &str) -> Result<(), TransportError>;

    /// Create an empty object without overwriting. `AlreadyExists` if it is
    /// present, `LeaseMissing` if it is present and leased.
    async fn create_object(&self, container: &str, name: &str) -> Result<(), TransportError>;

    async fn acquire_lease(
        &self,
        object: &ObjectRef,
        proposed_id: &str,
        ttl_seconds: u32,
    ) -> Result<(), TransportError>;

    async fn renew_lease(&self, object: &ObjectRef, id: &str) -> Result<(), TransportError>;

    async fn release_lease(&self, object: &ObjectRef, id: &str) -> Result<(), TransportError>;
}
