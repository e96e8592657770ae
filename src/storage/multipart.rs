use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use tracing::{debug, warn};
use crate::core::{LocalFile, Result, UploadError};
use super::{Checkpoint, CompletedPart, StorageClient, TransferOptions};

/// Raw multi-part API of an object store.
#[async_trait]
pub trait MultipartBackend: Send + Sync {
    /// Start a multi-part upload and return its upload id.
    async fn initiate(&self, key: &str, content_type: &str) -> Result<String>;

    /// Store one part and return its etag. Part numbers start at 1.
    async fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: Bytes) -> Result<String>;

    /// Assemble the parts and return the object url.
    async fn complete(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartSpec {
    number: u32,
    offset: u64,
    size: u64,
}

/// Split a file into parts. An empty file is still one (empty) part.
fn plan_parts(file_size: u64, part_size: u64) -> Vec<PartSpec> {
    let part_size = part_size.max(1);
    let mut parts = Vec::new();
    let mut offset = 0;
    let mut number = 1;

    while offset < file_size {
        let size = part_size.min(file_size - offset);
        parts.push(PartSpec { number, offset, size });
        offset += size;
        number += 1;
    }

    if parts.is_empty() {
        parts.push(PartSpec { number: 1, offset: 0, size: 0 });
    }

    parts
}

/// Resumable multi-part transfer over a [`MultipartBackend`].
///
/// Parts run with bounded parallelism; the cancellation token is checked
/// before each part and raced against each part in flight. Parts that already
/// landed stay on the backend.
pub struct MultipartClient<B> {
    backend: Arc<B>,
}

impl<B> MultipartClient<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

impl<B> MultipartClient<B>
where
    B: MultipartBackend,
{
    async fn initiate(&self, file: &LocalFile, key: &str, part_size: u64) -> Result<Checkpoint> {
        let upload_id = self.backend.initiate(key, &file.mime_type).await?;
        Ok(Checkpoint::new(key, upload_id, file.size, part_size))
    }

    /// Upload the parts `checkpoint` is missing, then assemble the object.
    async fn send_parts(
        &self,
        file: &LocalFile,
        key: &str,
        options: &TransferOptions,
        mut checkpoint: Checkpoint,
    ) -> Result<String> {
        let cancel = &options.cancel;
        let backend = &self.backend;

        let remaining: Vec<PartSpec> = plan_parts(file.size, checkpoint.part_size)
            .into_iter()
            .filter(|part| !checkpoint.has_part(part.number))
            .collect();
        let upload_id = checkpoint.upload_id.clone();

        let mut uploads = stream::iter(remaining)
            .map(|part| {
                let upload_id = upload_id.as_str();
                async move {
                    if cancel.is_cancelled() {
                        return Err(UploadError::Cancelled);
                    }

                    let data = file.read_range(part.offset, part.size as usize).await?;
                    let etag = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                        etag = backend.upload_part(key, upload_id, part.number, data) => etag?,
                    };

                    Ok(CompletedPart {
                        part_number: part.number,
                        etag,
                        size: part.size,
                    })
                }
            })
            .buffer_unordered(options.parallel.max(1));

        while let Some(result) = uploads.next().await {
            checkpoint.record(result?);
            if let Some(on_progress) = &options.on_progress {
                on_progress(checkpoint.fraction(), &checkpoint);
            }
        }
        drop(uploads);

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        checkpoint.parts.sort_by_key(|part| part.part_number);
        backend.complete(key, &checkpoint.upload_id, &checkpoint.parts).await
    }
}

#[async_trait]
impl<B> StorageClient for MultipartClient<B>
where
    B: MultipartBackend + 'static,
{
    async fn upload_file(&self, file: &LocalFile, key: &str, options: TransferOptions) -> Result<String> {
        let part_size = options.part_size.max(1);

        if options.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let resumable = options
            .checkpoint
            .clone()
            .filter(|checkpoint| checkpoint.matches(key, file.size, part_size));

        let Some(checkpoint) = resumable else {
            let checkpoint = self.initiate(file, key, part_size).await?;
            return self.send_parts(file, key, &options, checkpoint).await;
        };

        debug!(key, parts = checkpoint.parts.len(), "Resuming multipart upload");
        if let Some(on_progress) = &options.on_progress {
            on_progress(checkpoint.fraction(), &checkpoint);
        }

        let stale_id = checkpoint.upload_id.clone();
        match self.send_parts(file, key, &options, checkpoint).await {
            Err(err) if err.is_upload_expired() => {
                warn!(key, upload_id = %stale_id, "Multipart upload expired, starting over");
                let checkpoint = self.initiate(file, key, part_size).await?;
                self.send_parts(file, key, &options, checkpoint).await
            }
            result => result,
        }
    }
}
