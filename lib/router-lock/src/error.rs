use crate::name::NameError;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Invalid lock configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Lock {name} is held by another owner")]
    Contention { name: String },

    #[error("Lease transport error: {0}")]
    Transport(TransportError),

    #[error("Invalid lock operation: {0}")]
    Misuse(#[from] Misuse),

    #[error(transparent)]
    Lost(#[from] LockLost),

    #[error("Lock operation cancelled")]
    Cancelled,
}

impl LockError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Contention { .. } | LockError::Transport(_))
    }
}

/// Rejected construction input. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Empty access key is invalid")]
    EmptyAccessKey,

    #[error("Lock TTL of {}s is outside the allowed range of 15-60s", .0.as_secs_f64())]
    TtlOutOfRange(Duration),

    #[error("Invalid lock name: {0}")]
    InvalidName(#[from] NameError),

    #[error("Failed to parse storage endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Storage endpoint must use https, expected 'https://myaccount.blob.core.windows.net', got: {0}")]
    InsecureEndpoint(String),

    #[error("Storage endpoint must address the account root, expected 'https://myaccount.blob.core.windows.net', got: {0}")]
    EndpointHasPath(String),

    #[error("Access key must be valid base64")]
    InvalidAccessKey,

    #[error("Couldn't extract an account name from: {0}")]
    MissingAccountName(String),
}

/// An operation called from a state that doesn't allow it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    #[error("lock already acquired, call renew to extend it")]
    AlreadyAcquired,

    #[error("lock not acquired")]
    NotAcquired,

    #[error("lock instance already released and cannot be reused")]
    Released,
}

/// Delivered once when a held lease can no longer be renewed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Lock {name} ({id}) lost: {reason}")]
pub struct LockLost {
    pub name: String,
    pub id: Uuid,
    pub reason: String,
}
