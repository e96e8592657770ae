#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use material_upload::api::{
    CreateFolderRequest,
    CreateMaterialRequest,
    TemporaryCredentials,
    TenantStorageConfig,
};
use material_upload::storage::memory::{MemoryBackend, MemoryClientFactory};
use material_upload::{
    CredentialSource,
    FolderId,
    MaterialApi,
    MaterialId,
    MaterialListRefresher,
    Result,
    StorageClientManager,
    UploadConfig,
    UploadError,
    UploadManager,
};

#[derive(Default)]
pub struct FakeCredentials {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CredentialSource for FakeCredentials {
    async fn temporary_credentials(&self) -> Result<TemporaryCredentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TemporaryCredentials {
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            security_token: Some("token".to_string()),
            expiry: None,
        })
    }

    async fn tenant_storage_config(&self) -> Result<TenantStorageConfig> {
        Ok(TenantStorageConfig {
            region: "local".to_string(),
            endpoint: "memory://".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            bucket: "bucket".to_string(),
        })
    }
}

/// Records every material and folder request; ids count up from 1000.
#[derive(Default)]
pub struct RecordingMaterialApi {
    pub materials: Mutex<Vec<CreateMaterialRequest>>,
    pub folders: Mutex<Vec<CreateFolderRequest>>,
    /// Material requests received, failed ones included
    pub attempts: AtomicUsize,
    next_id: AtomicUsize,
    material_delay: Mutex<Duration>,
    failing_names: Mutex<Vec<String>>,
}

impl RecordingMaterialApi {
    pub fn delay_materials(&self, delay: Duration) {
        *self.material_delay.lock() = delay;
    }

    pub fn fail_material(&self, name: &str) {
        self.failing_names.lock().push(name.to_string());
    }

    fn next_id(&self) -> i64 {
        1000 + self.next_id.fetch_add(1, Ordering::SeqCst) as i64
    }
}

#[async_trait]
impl MaterialApi for RecordingMaterialApi {
    async fn create_material(&self, request: &CreateMaterialRequest) -> Result<MaterialId> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.material_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_names.lock().contains(&request.name) {
            return Err(UploadError::api(500, "material service unavailable"));
        }

        self.materials.lock().push(request.clone());
        Ok(self.next_id())
    }

    async fn create_folder(&self, request: &CreateFolderRequest) -> Result<FolderId> {
        self.folders.lock().push(request.clone());
        Ok(self.next_id())
    }
}

#[derive(Default)]
pub struct CountingRefresher {
    pub refreshes: AtomicUsize,
}

impl MaterialListRefresher for CountingRefresher {
    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub manager: UploadManager,
    pub backend: Arc<MemoryBackend>,
    pub credentials: Arc<FakeCredentials>,
    pub materials: Arc<RecordingMaterialApi>,
    pub refresher: Arc<CountingRefresher>,
}

impl Harness {
    pub fn new(config: UploadConfig) -> Self {
        Self::with_backend(config, MemoryBackend::new())
    }

    pub fn with_backend(config: UploadConfig, backend: MemoryBackend) -> Self {
        init_tracing();
        let backend = Arc::new(backend);
        let credentials = Arc::new(FakeCredentials::default());
        let materials = Arc::new(RecordingMaterialApi::default());
        let refresher = Arc::new(CountingRefresher::default());

        let clients = StorageClientManager::new(
            credentials.clone(),
            Arc::new(MemoryClientFactory::new(backend.clone())),
        );

        let manager = UploadManager::new(
            config,
            clients,
            materials.clone(),
            refresher.clone(),
        );

        Self {
            manager,
            backend,
            credentials,
            materials,
            refresher,
        }
    }

    pub fn exchanges(&self) -> usize {
        self.credentials.calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refresher.refreshes.load(Ordering::SeqCst)
    }
}

/// Route library logs through the test writer.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Small parts so a few bytes already exercise the multipart path.
pub fn small_parts() -> UploadConfig {
    UploadConfig {
        part_size: 10,
        part_concurrency: 1,
        ..UploadConfig::default()
    }
}

/// Poll `condition` until it holds, giving up after a couple of seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
