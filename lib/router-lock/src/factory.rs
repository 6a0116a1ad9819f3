//! Lock construction
//!
//! Validates the caller's inputs, makes sure the shared lock container and
//! the per-lock object exist, and builds a lock instance with its behaviors
//! attached.

use crate::behavior::BehaviorSet;
use crate::blob::BlobLeaseClient;
use crate::config::BlobTransportConfig;
use crate::error::{ConfigError, LockError, Result};
use crate::lock::{Lock, LockHandle};
use crate::name::LockName;
use crate::transport::{LeaseTransport, ObjectRef, TransportError, LOCK_CONTAINER};
use crate::ttl::LockTtl;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// A storage account addressed by its root endpoint and shared key
#[derive(Clone)]
pub struct StorageAccount {
    name: String,
    endpoint: Url,
    key: Vec<u8>,
}

impl StorageAccount {
    /// Parse `https://<account>.<host>` and a base64 access key. The endpoint
    /// must be the bare account root: no path, query or fragment.
    pub fn new(endpoint: &str, access_key: &str) -> std::result::Result<Self, ConfigError> {
        if access_key.is_empty() {
            return Err(ConfigError::EmptyAccessKey);
        }

        let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "https" {
            return Err(ConfigError::InsecureEndpoint(endpoint.to_string()));
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(ConfigError::EndpointHasPath(endpoint.to_string()));
        }

        let key = BASE64
            .decode(access_key)
            .map_err(|_| ConfigError::InvalidAccessKey)?;

        let name = url
            .host_str()
            .and_then(|host| host.split('.').next())
            .filter(|label| !label.is_empty())
            .ok_or_else(|| ConfigError::MissingAccountName(endpoint.to_string()))?
            .to_string();

        Ok(Self {
            name,
            endpoint: url,
            key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for StorageAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageAccount")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

/// Builds lock instances on top of one lease transport
#[derive(Clone)]
pub struct LockFactory {
    transport: Arc<dyn LeaseTransport>,
    default_behaviors: BehaviorSet,
}

impl LockFactory {
    pub fn new(transport: Arc<dyn LeaseTransport>) -> Self {
        Self {
            transport,
            default_behaviors: BehaviorSet::defaults(),
        }
    }

    /// A factory talking to the blob service of `account`
    pub fn for_account(account: &StorageAccount, config: BlobTransportConfig) -> Result<Self> {
        let client = BlobLeaseClient::new(account, config).map_err(LockError::Transport)?;
        Ok(Self::new(Arc::new(client)))
    }

    /// Behaviors used when `create` is called without an explicit set
    pub fn with_default_behaviors(mut self, behaviors: BehaviorSet) -> Self {
        self.default_behaviors = behaviors;
        self
    }

    /// Provision storage for `name` and build an `Idle` lock instance.
    ///
    /// `behaviors` replaces the factory defaults entirely when given. The
    /// instance's cancellation scope is a child of `parent`.
    pub async fn create(
        &self,
        parent: &CancellationToken,
        name: &LockName,
        ttl: LockTtl,
        behaviors: Option<BehaviorSet>,
    ) -> Result<Lock> {
        let object = ObjectRef::new(LOCK_CONTAINER, name.object_name());

        provision(parent, self.transport.create_container(LOCK_CONTAINER)).await?;
        debug!(container = LOCK_CONTAINER, "Lock container ready");
        provision(parent, self.transport.create_object(&object.container, &object.name)).await?;
        debug!(object = %object, "Lock object ready");

        let handle = LockHandle::new(
            name.clone(),
            ttl,
            object,
            self.transport.clone(),
            parent.child_token(),
        );
        let behaviors = behaviors.unwrap_or_else(|| self.default_behaviors.clone());
        let lock = behaviors.apply(Lock::new(handle));

        info!(
            lock = %name,
            lock_id = %lock.id(),
            ttl = ?ttl.as_duration(),
            behaviors = ?behaviors,
            "Lock instance created"
        );
        Ok(lock)
    }
}

// "Already exists" is the expected outcome once any coordinator has run.
async fn provision<F>(parent: &CancellationToken, call: F) -> Result<()>
where
    F: std::future::Future<Output = std::result::Result<(), TransportError>>,
{
    if parent.is_cancelled() {
        return Err(LockError::Cancelled);
    }
    match parent.run_until_cancelled(call).await {
        None => Err(LockError::Cancelled),
        Some(Ok(())) | Some(Err(TransportError::AlreadyExists)) | Some(Err(TransportError::LeaseMissing)) => Ok(()),
        Some(Err(e)) => Err(LockError::Transport(e)),
    }
}

/// Validate every input, then build a lock against the blob service at
/// `endpoint`.
///
/// Inputs are checked in order: access key present, ttl within 15-60s, lock
/// name, endpoint (https, account root), access key is base64. No storage
/// call is made unless all of them pass. `None` for `behaviors` selects
/// [`BehaviorSet::defaults`].
pub async fn create_lock(
    parent: &CancellationToken,
    endpoint: &str,
    access_key: &str,
    name: &str,
    ttl: Duration,
    behaviors: Option<BehaviorSet>,
) -> Result<Lock> {
    if access_key.is_empty() {
        return Err(ConfigError::EmptyAccessKey.into());
    }
    let ttl = LockTtl::new(ttl)?;
    let name = LockName::parse(name).map_err(ConfigError::from)?;
    let account = StorageAccount::new(endpoint, access_key)?;

    LockFactory::for_account(&account, BlobTransportConfig::default())?
        .create(parent, &name, ttl, behaviors)
        .await
}


#[cfg(test)]
mod tests {
    use super::test_support::memory_store;
    use super::*;
    use crate::lock::LockState;
    use crate::memory::Operation;
    use crate::name::NameError;

    const ENDPOINT: &str = "https://mystorageaccount.blob.core.windows.net";
    const KEY: &str = "c2VjcmV0LWtleQ==";

    #[test]
    fn test_account_from_endpoint() {
        let account = StorageAccount::new(ENDPOINT, KEY).unwrap();
        assert_eq!(account.name(), "mystorageaccount");
        assert_eq!(account.key(), b"secret-key");
        assert_eq!(account.endpoint().host_str(), Some("mystorageaccount.blob.core.windows.net"));

        let with_slash = StorageAccount::new("https://acct.blob.core.windows.net/", KEY).unwrap();
        assert_eq!(with_slash.name(), "acct");
    }

    #[test]
    fn test_account_rejects_bad_endpoints() {
        assert!(matches!(
            StorageAccount::new("not a url", KEY),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            StorageAccount::new("http://acct.blob.core.windows.net", KEY),
            Err(ConfigError::InsecureEndpoint(_))
        ));
        assert!(matches!(
            StorageAccount::new("https://acct.blob.core.windows.net/container", KEY),
            Err(ConfigError::EndpointHasPath(_))
        ));
        assert!(matches!(
            StorageAccount::new("https://acct.blob.core.windows.net?sv=2020&sig=x", KEY),
            Err(ConfigError::EndpointHasPath(_))
        ));
        assert!(matches!(
            StorageAccount::new("https://acct.blob.core.windows.net/#frag", KEY),
            Err(ConfigError::EndpointHasPath(_))
        ));
        assert!(matches!(
            StorageAccount::new(ENDPOINT, "not base64!"),
            Err(ConfigError::InvalidAccessKey)
        ));
        assert!(matches!(StorageAccount::new(ENDPOINT, ""), Err(ConfigError::EmptyAccessKey)));
    }

    #[tokio::test]
    async fn test_create_lock_checks_in_order() {
        let parent = CancellationToken::new();
        let ttl = Duration::from_secs(15);

        let err = create_lock(&parent, "http://x", "", "bad name", Duration::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Config(ConfigError::EmptyAccessKey)));

        let err = create_lock(&parent, "http://x", "!", "bad name", Duration::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Config(ConfigError::TtlOutOfRange(_))));

        let err = create_lock(&parent, "http://x", "!", "bad name", ttl, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LockError::Config(ConfigError::InvalidName(NameError::InvalidCharacter { .. }))
        ));

        let err = create_lock(&parent, "http://x", "!", "svc-a", ttl, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Config(ConfigError::InsecureEndpoint(_))));

        let err = create_lock(&parent, ENDPOINT, "!", "svc-a", ttl, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Config(ConfigError::InvalidAccessKey)));
    }

    #[tokio::test]
    async fn test_create_provisions_idempotently() {
        let store = memory_store();
        let factory = LockFactory::new(store.clone());
        let parent = CancellationToken::new();
        let name = LockName::parse("svc-a").unwrap();
        let ttl = LockTtl::from_secs(15).unwrap();

        let first = factory.create(&parent, &name, ttl, Some(BehaviorSet::new())).await.unwrap();
        let second = factory.create(&parent, &name, ttl, Some(BehaviorSet::new())).await.unwrap();

        assert_eq!(store.calls(Operation::CreateContainer), 2);
        assert_eq!(store.calls(Operation::CreateObject), 2);
        assert_ne!(first.id(), second.id());
        assert_eq!(first.handle().object().name, "azlk-svc-a");
        assert_eq!(first.handle().object().container, LOCK_CONTAINER);
        assert_eq!(second.state().await, LockState::Idle);
    }

    #[tokio::test]
    async fn test_create_tolerates_leased_object() {
        let store = memory_store();
        let factory = LockFactory::new(store.clone());
        let parent = CancellationToken::new();
        let name = LockName::parse("svc-a").unwrap();
        let ttl = LockTtl::from_secs(15).unwrap();

        let holder = factory.create(&parent, &name, ttl, Some(BehaviorSet::new())).await.unwrap();
        holder.lock().await.unwrap();

        let waiting = factory.create(&parent, &name, ttl, Some(BehaviorSet::new())).await;
        assert!(waiting.is_ok());
    }

    #[tokio::test]
    async fn test_create_surfaces_transport_errors() {
        let store = memory_store();
        store.fail_next(Operation::CreateContainer, 1).await;
        let factory = LockFactory::new(store.clone());

        let err = factory
            .create(
                &CancellationToken::new(),
                &LockName::parse("svc-a").unwrap(),
                LockTtl::from_secs(15).unwrap(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Transport(TransportError::Status { status: 500, .. })));
        assert_eq!(store.calls(Operation::CreateObject), 0);
    }

    #[tokio::test]
    async fn test_behavior_selection() {
        let store = memory_store();
        let parent = CancellationToken::new();
        let name = LockName::parse("svc-a").unwrap();
        let ttl = LockTtl::from_secs(15).unwrap();

        // auto-renew, panic-on-lost-lock and unlock-on-cancel each run a task
        let defaults = LockFactory::new(store.clone()).create(&parent, &name, ttl, None).await.unwrap();
        assert_eq!(defaults.watcher_count(), 3);

        let explicit = LockFactory::new(store.clone())
            .create(&parent, &name, ttl, Some(BehaviorSet::new().with(crate::behavior::AutoRenew)))
            .await
            .unwrap();
        assert_eq!(explicit.watcher_count(), 1);

        let none = LockFactory::new(store.clone())
            .with_default_behaviors(BehaviorSet::new())
            .create(&parent, &name, ttl, None)
            .await
            .unwrap();
        assert_eq!(none.watcher_count(), 0);

        parent.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_parent_blocks_provisioning() {
        let store = memory_store();
        let parent = CancellationToken::new();
        parent.cancel();

        let err = LockFactory::new(store.clone())
            .create(
                &parent,
                &LockName::parse("svc-a").unwrap(),
                LockTtl::from_secs(15).unwrap(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
        assert_eq!(store.total_calls(), 0);
    }
}
