//! In-memory multipart backend for tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use crate::api::{TemporaryCredentials, TenantStorageConfig};
use crate::core::{Result, UploadError};
use super::{CompletedPart, MultipartBackend, MultipartClient, StorageClient, StorageClientFactory};

#[derive(Default)]
struct MemoryState {
    next_upload: u64,
    uploads: HashMap<String, BTreeMap<u32, Bytes>>,
    objects: HashMap<String, Bytes>,
    part_uploads: usize,
    failing_keys: Vec<String>,
    /// Parts allowed to succeed before every further part fails
    part_allowance: Option<usize>,
    auth_failures: usize,
}

/// Multipart backend keeping objects in a `HashMap`.
///
/// Failures can be injected per key fragment, after a number of parts, or as
/// authorization errors, so callers can exercise their error paths.
pub struct MemoryBackend {
    base_url: String,
    part_delay: Duration,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            base_url: "memory://bucket".to_string(),
            part_delay: Duration::ZERO,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Sleep this long inside every part upload.
    pub fn with_part_delay(mut self, part_delay: Duration) -> Self {
        self.part_delay = part_delay;
        self
    }

    /// Fail every part whose key contains `fragment`.
    pub fn fail_parts_matching(&self, fragment: impl Into<String>) {
        self.state.lock().failing_keys.push(fragment.into());
    }

    /// Let `parts` more parts succeed, then fail the rest.
    pub fn fail_after_parts(&self, parts: usize) {
        self.state.lock().part_allowance = Some(parts);
    }

    /// Reject the next `count` part uploads as unauthorized.
    pub fn fail_auth(&self, count: usize) {
        self.state.lock().auth_failures = count;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_keys.clear();
        state.part_allowance = None;
        state.auth_failures = 0;
    }

    /// Forget every open multipart upload, as a store does when it aborts
    /// or expires them.
    pub fn expire_uploads(&self) {
        self.state.lock().uploads.clear();
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().objects.get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Number of part uploads attempted so far.
    pub fn part_uploads(&self) -> usize {
        self.state.lock().part_uploads
    }

    fn check_failures(&self, key: &str, part_number: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.part_uploads += 1;

        if state.auth_failures > 0 {
            state.auth_failures -= 1;
            return Err(UploadError::Auth("security token expired".to_string()));
        }
        if state.failing_keys.iter().any(|fragment| key.contains(fragment.as_str())) {
            return Err(UploadError::storage(format!("part {} of {} rejected", part_number, key)));
        }
        if let Some(allowance) = state.part_allowance.as_mut() {
            if *allowance == 0 {
                return Err(UploadError::storage(format!("connection reset on part {}", part_number)));
            }
            *allowance -= 1;
        }

        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MultipartBackend for MemoryBackend {
    async fn initiate(&self, key: &str, _content_type: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.next_upload += 1;
        let upload_id = format!("{}-{}", key, state.next_upload);
        state.uploads.insert(upload_id.clone(), BTreeMap::new());
        Ok(upload_id)
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: Bytes) -> Result<String> {
        if !self.part_delay.is_zero() {
            tokio::time::sleep(self.part_delay).await;
        }
        self.check_failures(key, part_number)?;

        let mut state = self.state.lock();
        let parts = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::UploadExpired(upload_id.to_string()))?;
        parts.insert(part_number, data);

        Ok(format!("etag-{}-{}", upload_id, part_number))
    }

    async fn complete(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<String> {
        let mut state = self.state.lock();
        let stored = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| UploadError::UploadExpired(upload_id.to_string()))?;

        let mut object = BytesMut::new();
        for part in parts {
            let data = stored
                .get(&part.part_number)
                .ok_or_else(|| UploadError::storage(format!("missing part {}", part.part_number)))?;
            object.extend_from_slice(data);
        }
        state.objects.insert(key.to_string(), object.freeze());

        Ok(format!("{}/{}", self.base_url, key))
    }
}

/// Builds [`MultipartClient`]s sharing one [`MemoryBackend`].
pub struct MemoryClientFactory {
    backend: Arc<MemoryBackend>,
}

impl MemoryClientFactory {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }
}

impl StorageClientFactory for MemoryClientFactory {
    fn build(&self, _: &TemporaryCredentials, _: &TenantStorageConfig) -> Result<Arc<dyn StorageClient>> {
        Ok(Arc::new(MultipartClient::new(self.backend.clone())))
    }
}
