use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::api::CredentialSource;
use crate::core::Result;
use super::{StorageClient, StorageClientFactory};

/// Shorter than the one hour the credentials actually live.
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(45 * 60);

struct CachedClient {
    client: Arc<dyn StorageClient>,
    expires_at: Instant,
}

/// Hands out a storage client, exchanging short-lived credentials only when
/// the cached one expired or was invalidated.
///
/// Concurrent callers during a miss wait on the same exchange: the cache lock
/// is held across the credential round trips.
pub struct StorageClientManager {
    credentials: Arc<dyn CredentialSource>,
    factory: Arc<dyn StorageClientFactory>,
    cache_duration: Duration,
    cache: Mutex<Option<CachedClient>>,
    exchanges: AtomicUsize,
}

impl StorageClientManager {
    pub fn new(credentials: Arc<dyn CredentialSource>, factory: Arc<dyn StorageClientFactory>) -> Self {
        Self {
            credentials,
            factory,
            cache_duration: DEFAULT_CACHE_DURATION,
            cache: Mutex::new(None),
            exchanges: AtomicUsize::new(0),
        }
    }

    pub fn with_cache_duration(mut self, cache_duration: Duration) -> Self {
        self.cache_duration = cache_duration;
        self
    }

    pub async fn get_client(&self) -> Result<Arc<dyn StorageClient>> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.client.clone());
            }
            debug!("Storage client expired");
        }

        // Never leave a stale entry behind a failed exchange
        *cache = None;

        let client = self.exchange().await?;
        *cache = Some(CachedClient {
            client: client.clone(),
            expires_at: Instant::now() + self.cache_duration,
        });

        Ok(client)
    }

    /// Like [`get_client`](Self::get_client), retrying exactly once on a
    /// cleared cache before giving up.
    pub async fn get_client_with_retry(&self) -> Result<Arc<dyn StorageClient>> {
        match self.get_client().await {
            Ok(client) => Ok(client),
            Err(err) => {
                warn!(error = %err, "Storage client acquisition failed, retrying once");
                self.clear_cache().await;
                self.get_client().await
            }
        }
    }

    pub async fn clear_cache(&self) {
        if self.cache.lock().await.take().is_some() {
            info!("Storage client cache cleared");
        }
    }

    pub async fn is_cache_valid(&self) -> bool {
        self.cache
            .lock()
            .await
            .as_ref()
            .is_some_and(|cached| Instant::now() < cached.expires_at)
    }

    /// Time until the cached client expires, zero when nothing is cached.
    pub async fn remaining_time(&self) -> Duration {
        self.cache
            .lock()
            .await
            .as_ref()
            .map(|cached| cached.expires_at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Number of credential exchanges performed so far.
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    async fn exchange(&self) -> Result<Arc<dyn StorageClient>> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        let credentials = self.credentials.temporary_credentials().await?;
        let config = self.credentials.tenant_storage_config().await?;
        let client = self.factory.build(&credentials, &config)?;

        info!(bucket = %config.bucket, region = %config.region, "Storage client created");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use async_trait::async_trait;
    use crate::api::{TemporaryCredentials, TenantStorageConfig};
    use crate::core::{LocalFile, UploadError};
    use crate::storage::TransferOptions;

    #[derive(Default)]
    struct FakeCredentials {
        calls: AtomicUsize,
        failures_left: AtomicUsize,
        slow: AtomicBool,
    }

    #[async_trait]
    impl CredentialSource for FakeCredentials {
        async fn temporary_credentials(&self) -> Result<TemporaryCredentials> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(UploadError::Auth("sts unavailable".into()));
            }
            Ok(TemporaryCredentials {
                access_key: "ak".into(),
                secret_key: "sk".into(),
                security_token: None,
                expiry: None,
            })
        }

        async fn tenant_storage_config(&self) -> Result<TenantStorageConfig> {
            Ok(TenantStorageConfig {
                region: "local".into(),
                endpoint: "memory://".into(),
                access_key: "ak".into(),
                secret_key: "sk".into(),
                bucket: "assets".into(),
            })
        }
    }

    struct NullClient;

    #[async_trait]
    impl StorageClient for NullClient {
        async fn upload_file(&self, _file: &LocalFile, key: &str, _options: TransferOptions) -> Result<String> {
            Ok(key.to_string())
        }
    }

    struct NullFactory;

    impl StorageClientFactory for NullFactory {
        fn build(&self, _: &TemporaryCredentials, _: &TenantStorageConfig) -> Result<Arc<dyn StorageClient>> {
            Ok(Arc::new(NullClient))
        }
    }

    fn manager(credentials: Arc<FakeCredentials>) -> StorageClientManager {
        StorageClientManager::new(credentials, Arc::new(NullFactory))
            .with_cache_duration(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_cache_reuse_and_clear() {
        let credentials = Arc::new(FakeCredentials::default());
        let manager = manager(credentials.clone());

        manager.get_client().await.unwrap();
        manager.get_client().await.unwrap();
        assert_eq!(credentials.calls.load(Ordering::SeqCst), 1);
        assert!(manager.is_cache_valid().await);

        manager.clear_cache().await;
        manager.clear_cache().await;
        assert!(!manager.is_cache_valid().await);
        assert_eq!(manager.remaining_time().await, Duration::ZERO);

        manager.get_client().await.unwrap();
        assert_eq!(credentials.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiry() {
        let credentials = Arc::new(FakeCredentials::default());
        let manager = manager(credentials.clone());

        manager.get_client().await.unwrap();
        assert_eq!(manager.remaining_time().await, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!manager.is_cache_valid().await);

        manager.get_client().await.unwrap();
        assert_eq!(credentials.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_once() {
        let credentials = Arc::new(FakeCredentials::default());
        credentials.failures_left.store(1, Ordering::SeqCst);
        let manager = manager(credentials.clone());

        manager.get_client_with_retry().await.unwrap();
        assert_eq!(credentials.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_second_failure() {
        let credentials = Arc::new(FakeCredentials::default());
        credentials.failures_left.store(5, Ordering::SeqCst);
        let manager = manager(credentials.clone());

        let err = manager.get_client_with_retry().await.err().unwrap();
        assert!(err.is_auth());
        assert_eq!(credentials.calls.load(Ordering::SeqCst), 2);
        assert!(!manager.is_cache_valid().await);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_exchange() {
        let credentials = Arc::new(FakeCredentials::default());
        credentials.slow.store(true, Ordering::SeqCst);
        let manager = Arc::new(manager(credentials.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_client().await.map(|_| ()) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(manager.exchange_count(), 1);
    }
}
