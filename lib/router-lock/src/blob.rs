//! Blob service lease transport
//!
//! Talks to the storage REST API directly: containers and block blobs are
//! created with `PUT`, leases are managed with `PUT ?comp=lease`. Requests
//! are signed with the account's shared key.

use crate::backoff::ExponentialBackoff;
use crate::config::BlobTransportConfig;
use crate::factory::StorageAccount;
use crate::transport::{LeaseTransport, ObjectRef, TransportError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, IF_NONE_MATCH};
use reqwest::{Client, Response};
use sha2::Sha256;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const ERROR_CODE_HEADER: &str = "x-ms-error-code";

/// One signed `PUT` against the blob service
#[derive(Debug)]
struct BlobRequest {
    path: String,
    query: Vec<(&'static str, &'static str)>,
    headers: BTreeMap<&'static str, String>,
    if_none_match: Option<&'static str>,
}

impl BlobRequest {
    fn new(path: String) -> Self {
        Self {
            path,
            query: Vec::new(),
            headers: BTreeMap::new(),
            if_none_match: None,
        }
    }

    fn query(mut self, name: &'static str, value: &'static str) -> Self {
        self.query.push((name, value));
        self
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value.into());
        self
    }

    fn lease(object: &ObjectRef, action: &'static str) -> Self {
        Self::new(format!("/{}/{}", object.container, object.name))
            .query("comp", "lease")
            .header("x-ms-lease-action", action)
    }
}

/// [`LeaseTransport`] for the blob service of one storage account
pub struct BlobLeaseClient {
    http: Client,
    account: String,
    endpoint: Url,
    mac: HmacSha256,
    config: BlobTransportConfig,
}

impl BlobLeaseClient {
    pub fn new(account: &StorageAccount, config: BlobTransportConfig) -> Result<Self, TransportError> {
        Self::from_parts(account.endpoint().clone(), account.name(), account.key(), config)
    }

    /// Build a client for any endpoint, including plain-http emulators
    pub fn from_parts(
        endpoint: Url,
        account: &str,
        key: &[u8],
        config: BlobTransportConfig,
    ) -> Result<Self, TransportError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        let mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        Ok(Self {
            http,
            account: account.to_string(),
            endpoint,
            mac,
            config,
        })
    }

    async fn send(&self, request: &BlobRequest) -> Result<(), TransportError> {
        self.send_with_attempts(request).await.0
    }

    /// Like `send`, also reporting how many attempts were made
    async fn send_with_attempts(&self, request: &BlobRequest) -> (Result<(), TransportError>, u32) {
        let mut backoff = ExponentialBackoff::new(self.config.retry_initial_interval, None);

        let mut attempt = 1;
        loop {
            match self.send_once(request).await {
                Err(e) if e.is_transient() && attempt < self.config.max_tries => {
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(path = %request.path, attempt, error = %e, ?delay, "Storage request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return (result, attempt),
            }
        }
    }

    async fn send_once(&self, request: &BlobRequest) -> Result<(), TransportError> {
        let mut url = self.endpoint.clone();
        url.set_path(&request.path);
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter().copied());
        }

        let mut headers = request.headers.clone();
        headers.insert("x-ms-date", http_date(Utc::now()));
        headers.insert("x-ms-version", self.config.api_version.clone());

        let resource = canonicalized_resource(&self.account, &request.path, &request.query);
        let to_sign = string_to_sign("PUT", request.if_none_match, &headers, &resource);
        let authorization = format!("SharedKey {}:{}", self.account, self.sign(&to_sign));

        let mut builder = self
            .http
            .put(url)
            .header(AUTHORIZATION, authorization)
            .body(Vec::new());
        for (name, value) in &headers {
            builder = builder.header(*name, value.as_str());
        }
        if let Some(condition) = request.if_none_match {
            builder = builder.header(IF_NONE_MATCH, condition);
        }

        let response = builder.send().await?;
        debug!(path = %request.path, status = %response.status(), "Storage request completed");
        check(response)
    }

    fn sign(&self, string_to_sign: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(string_to_sign.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl LeaseTransport for BlobLeaseClient {
    async fn create_container(&self, container: &str) -> Result<(), TransportError> {
        self.send(&BlobRequest::new(format!("/{}", container)).query("restype", "container"))
            .await
    }

    async fn create_object(&self, container: &str, name: &str) -> Result<(), TransportError> {
        let mut request = BlobRequest::new(format!("/{}/{}", container, name))
            .header("x-ms-blob-type", "BlockBlob");
        request.if_none_match = Some("*");
        self.send(&request).await
    }

    async fn acquire_lease(
        &self,
        object: &ObjectRef,
        proposed_id: &str,
        ttl_seconds: u32,
    ) -> Result<(), TransportError> {
        let request = BlobRequest::lease(object, "acquire")
            .header("x-ms-lease-duration", ttl_seconds.to_string())
            .header("x-ms-proposed-lease-id", proposed_id);
        self.send(&request).await
    }

    async fn renew_lease(&self, object: &ObjectRef, id: &str) -> Result<(), TransportError> {
        self.send(&BlobRequest::lease(object, "renew").header("x-ms-lease-id", id))
            .await
    }

    async fn release_lease(&self, object: &ObjectRef, id: &str) -> Result<(), TransportError> {
        let request = BlobRequest::lease(object, "release").header("x-ms-lease-id", id);
        match self.send_with_attempts(&request).await {
            // an earlier attempt may have released the lease before failing
            (Err(TransportError::LeaseLost), attempts) if attempts > 1 => {
                debug!(object = %object, attempts, "Lease already gone on retried release");
                Ok(())
            }
            (result, _) => result,
        }
    }
}

fn check(response: Response) -> Result<(), TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let code = response
        .headers()
        .get(ERROR_CODE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    Err(classify(status.as_u16(), code))
}

fn classify(status: u16, code: Option<String>) -> TransportError {
    match code.as_deref() {
        Some("ContainerAlreadyExists") | Some("BlobAlreadyExists") => TransportError::AlreadyExists,
        Some("LeaseIdMissing") => TransportError::LeaseMissing,
        Some("LeaseAlreadyPresent") | Some("LeaseIsBreakingAndCannotBeAcquired") => {
            TransportError::LeaseHeld
        }
        Some("LeaseIdMismatchWithLeaseOperation")
        | Some("LeaseNotPresentWithLeaseOperation")
        | Some("LeaseIsBrokenAndCannotBeRenewed")
        | Some("LeaseLost") => TransportError::LeaseLost,
        _ => TransportError::Status { status, code },
    }
}

fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `/<account><path>` followed by `\n<name>:<value>` per query parameter,
/// sorted by name
fn canonicalized_resource(account: &str, path: &str, query: &[(&str, &str)]) -> String {
    let params: BTreeMap<String, &str> = query
        .iter()
        .map(|(name, value)| (name.to_lowercase(), *value))
        .collect();

    let mut resource = format!("/{}{}", account, path);
    for (name, value) in params {
        resource.push('\n');
        resource.push_str(&name);
        resource.push(':');
        resource.push_str(value);
    }
    resource
}

/// Shared key string-to-sign. Only `If-None-Match` among the standard
/// headers is ever set; a zero content length is signed as empty.
fn string_to_sign(
    verb: &str,
    if_none_match: Option<&str>,
    ms_headers: &BTreeMap<&str, String>,
    resource: &str,
) -> String {
    let mut canonical_headers = String::new();
    for (name, value) in ms_headers {
        canonical_headers.push_str(&name.to_lowercase());
        canonical_headers.push(':');
        canonical_headers.push_str(value.trim());
        canonical_headers.push('\n');
    }

    format!(
        "{}\n\n\n\n\n\n\n\n\n{}\n\n\n{}{}",
        verb,
        if_none_match.unwrap_or_default(),
        canonical_headers,
        resource
    )
}
