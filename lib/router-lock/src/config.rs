//! Blob transport configuration

use std::time::Duration;

/// Settings for [`BlobLeaseClient`](crate::blob::BlobLeaseClient)
#[derive(Clone, Debug)]
pub struct BlobTransportConfig {
    /// Storage REST API version sent as `x-ms-version`
    pub api_version: String,
    /// Timeout for a single HTTP request
    pub request_timeout: Duration,
    /// Attempts per call, including the first, for transient failures
    pub max_tries: u32,
    /// Delay before the first retry; grows exponentially after that
    pub retry_initial_interval: Duration,
}

impl Default for BlobTransportConfig {
    fn default() -> Self {
        Self {
            api_version: "2016-05-31".to_string(),
            request_timeout: Duration::from_secs(30),
            max_tries: 3,
            retry_initial_interval: Duration::from_millis(500),
        }
    }
}
