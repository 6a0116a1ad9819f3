//! Lease duration bounds

use crate::error::ConfigError;
use std::time::Duration;

/// Shortest lease the storage service grants
pub const MIN_TTL: Duration = Duration::from_secs(15);
/// Longest finite lease the storage service grants
pub const MAX_TTL: Duration = Duration::from_secs(60);

/// A lease duration within [`MIN_TTL`, `MAX_TTL`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockTtl(Duration);

impl LockTtl {
    pub fn new(ttl: Duration) -> Result<Self, ConfigError> {
        if ttl < MIN_TTL || ttl > MAX_TTL {
            return Err(ConfigError::TtlOutOfRange(ttl));
        }
        Ok(Self(ttl))
    }

    pub fn from_secs(secs: u64) -> Result<Self, ConfigError> {
        Self::new(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Whole seconds as sent on the wire
    pub fn lease_seconds(&self) -> u32 {
        self.0.as_secs() as u32
    }

    /// Interval between automatic renewals
    pub fn renew_interval(&self) -> Duration {
        self.0 / 2
    }
}
