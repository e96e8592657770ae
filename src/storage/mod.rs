//! Object-storage side of an upload: the transfer primitive, resumable
//! checkpoints and the credential-backed client cache.

mod cache;
pub mod memory;
pub mod multipart;

use std::sync::Arc;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use crate::api::{TemporaryCredentials, TenantStorageConfig};
use crate::core::{LocalFile, Result, UploadError};

pub use cache::{StorageClientManager, DEFAULT_CACHE_DURATION};
pub use multipart::{MultipartBackend, MultipartClient};

pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_PART_CONCURRENCY: usize = 3;

/// Called with the completed fraction (0.0..=1.0) and the latest checkpoint.
pub type ProgressFn = Arc<dyn Fn(f64, &Checkpoint) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Resumption state of a multi-part transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: String,
    pub upload_id: String,
    pub file_size: u64,
    pub part_size: u64,
    pub parts: Vec<CompletedPart>,
}

impl Checkpoint {
    pub fn new(key: impl Into<String>, upload_id: impl Into<String>, file_size: u64, part_size: u64) -> Self {
        Self {
            key: key.into(),
            upload_id: upload_id.into(),
            file_size,
            part_size,
            parts: Vec::new(),
        }
    }

    /// Whether this checkpoint can resume a transfer with these parameters.
    pub fn matches(&self, key: &str, file_size: u64, part_size: u64) -> bool {
        self.key == key && self.file_size == file_size && self.part_size == part_size
    }

    pub fn has_part(&self, part_number: u32) -> bool {
        self.parts.iter().any(|part| part.part_number == part_number)
    }

    pub fn record(&mut self, part: CompletedPart) {
        if !self.has_part(part.part_number) {
            self.parts.push(part);
        }
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.parts.iter().map(|part| part.size).sum()
    }

    pub fn fraction(&self) -> f64 {
        if self.file_size == 0 {
            return if self.parts.is_empty() { 0.0 } else { 1.0 };
        }
        (self.uploaded_bytes() as f64 / self.file_size as f64).clamp(0.0, 1.0)
    }

    /// Opaque token handed to callers that persist resumption state.
    pub fn to_token(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    pub fn from_token(token: &str) -> Result<Self> {
        let json = STANDARD
            .decode(token)
            .map_err(|err| UploadError::Checkpoint(err.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[derive(Clone)]
pub struct TransferOptions {
    pub part_size: u64,
    pub parallel: usize,
    pub cancel: CancellationToken,
    pub checkpoint: Option<Checkpoint>,
    pub on_progress: Option<ProgressFn>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            parallel: DEFAULT_PART_CONCURRENCY,
            cancel: CancellationToken::new(),
            checkpoint: None,
            on_progress: None,
        }
    }
}

/// Client authorized against the object-storage backend.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Upload `file` under `key` and return the object's url.
    ///
    /// Must resolve to [`UploadError::Cancelled`] once `options.cancel` fires.
    async fn upload_file(&self, file: &LocalFile, key: &str, options: TransferOptions) -> Result<String>;
}

/// Builds a client from the result of a credential exchange.
pub trait StorageClientFactory: Send + Sync {
    fn build(
        &self,
        credentials: &TemporaryCredentials,
        config: &TenantStorageConfig,
    ) -> Result<Arc<dyn StorageClient>>;
}
