use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use crate::api::{CreateMaterialRequest, MaterialApi, MaterialListRefresher};
use crate::config::UploadConfig;
use crate::folders::{FolderMaterializer, folder_paths_of};
use crate::limiter::ConcurrencyLimiter;
use crate::storage::{Checkpoint, StorageClientManager, TransferOptions};
use crate::utils::format_bytes;
use super::errors::{Result, UploadError};
use super::file::LocalFile;
use super::store::TaskStore;
use super::task::UploadTask;
use super::types::{
    ConfirmOutcome,
    FolderId,
    MaterialId,
    MaterialStatus,
    RemoveOutcome,
    TaskId,
    TaskLocation,
    TaskStats,
    UploadEvent,
    UploadStatus,
};

/// Fields a caller may change on an existing task.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub target_folder_id: Option<FolderId>,
    pub location: Option<TaskLocation>,
}

struct ManagerInner {
    store: RwLock<TaskStore>,
    clients: Arc<StorageClientManager>,
    materials: Arc<dyn MaterialApi>,
    refresher: Arc<dyn MaterialListRefresher>,
    limiter: ConcurrencyLimiter,
    config: UploadConfig,
    foreground_batches: AtomicUsize,
    event_tx: broadcast::Sender<UploadEvent>,
}

/// Owns every upload task and drives transfers plus material creation.
///
/// Cheap to clone; clones share the same tasks.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<ManagerInner>,
}

/// Keeps the foreground "uploading" flag raised while a batch runs.
struct ForegroundBatch<'a>(&'a AtomicUsize);

impl<'a> ForegroundBatch<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ForegroundBatch<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UploadManager {
    /// The storage client cache takes its lifetime from
    /// `config.client_cache_duration`.
    pub fn new(
        config: UploadConfig,
        clients: StorageClientManager,
        materials: Arc<dyn MaterialApi>,
        refresher: Arc<dyn MaterialListRefresher>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(ManagerInner {
                store: RwLock::new(TaskStore::new()),
                clients: Arc::new(clients.with_cache_duration(config.cache_duration())),
                materials,
                refresher,
                limiter: ConcurrencyLimiter::new(config.max_concurrent_uploads.max(1)),
                config,
                foreground_batches: AtomicUsize::new(0),
                event_tx,
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.inner.limiter
    }

    pub fn storage_clients(&self) -> &Arc<StorageClientManager> {
        &self.inner.clients
    }

    /// Whether a foreground batch is currently running.
    pub fn is_uploading(&self) -> bool {
        self.inner.foreground_batches.load(Ordering::SeqCst) > 0
    }

    fn emit(&self, event: UploadEvent) {
        // No subscribers is fine
        let _ = self.inner.event_tx.send(event);
    }

    fn emit_status(&self, id: TaskId, from: UploadStatus, to: UploadStatus, error: Option<String>) {
        self.emit(UploadEvent::StatusChanged { id, from, to, error });
    }

    /// Start tracking the given tasks. Duplicates of the same file are allowed.
    pub async fn add_tasks(&self, tasks: Vec<UploadTask>) -> Vec<TaskId> {
        let mut store = self.inner.store.write().await;
        tasks
            .into_iter()
            .map(|task| {
                let location = task.location;
                let id = store.insert(task);
                debug!(task_id = %id, ?location, "Task added");
                self.emit(UploadEvent::TaskAdded { id, location });
                id
            })
            .collect()
    }

    pub async fn add_task(&self, task: UploadTask) -> TaskId {
        let location = task.location;
        let id = self.inner.store.write().await.insert(task);
        debug!(task_id = %id, ?location, "Task added");
        self.emit(UploadEvent::TaskAdded { id, location });
        id
    }

    /// Build a task for `file` using the configured remote path prefix.
    pub fn create_task(&self, file: LocalFile, location: TaskLocation) -> UploadTask {
        UploadTask::builder(file)
            .location(location)
            .path_prefix(self.inner.config.remote_path_prefix.clone())
            .build()
    }

    pub async fn add_files(&self, files: Vec<LocalFile>, location: TaskLocation) -> Vec<TaskId> {
        let tasks = files
            .into_iter()
            .map(|file| self.create_task(file, location))
            .collect();
        self.add_tasks(tasks).await
    }

    /// Stop-then-delete. A task whose material record is being created is
    /// only flagged, and disappears once creation settles.
    pub async fn remove_task(&self, id: TaskId) -> Result<RemoveOutcome> {
        let mut store = self.inner.store.write().await;
        let creating = store
            .get(&id)
            .ok_or(UploadError::TaskNotFound(id))?
            .material_status
            == MaterialStatus::Creating;

        if creating {
            store.defer_removal(&id);
            info!(task_id = %id, "Removal deferred until material creation settles");
            return Ok(RemoveOutcome::Deferred);
        }

        if let Some(from) = store.mark_cancelled(&id) {
            self.emit_status(id, from, UploadStatus::Cancelled, Some(UploadError::Cancelled.to_string()));
        }
        store.remove(&id);
        info!(task_id = %id, "Task removed");
        self.emit(UploadEvent::TaskRemoved { id });

        Ok(RemoveOutcome::Removed)
    }

    /// Apply a caller-side patch through the store's single mutation path.
    pub async fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<()> {
        let mut store = self.inner.store.write().await;
        let location_changed = store
            .update(&id, |entry| {
                if let Some(folder_id) = update.target_folder_id {
                    entry.task.target_folder_id = Some(folder_id);
                }
                match update.location {
                    Some(location) if location != entry.task.location => {
                        entry.task.location = location;
                        Some(location)
                    }
                    _ => None,
                }
            })
            .ok_or(UploadError::TaskNotFound(id))?;

        if let Some(location) = location_changed {
            self.emit(UploadEvent::LocationChanged { id, location });
        }
        Ok(())
    }

    async fn set_location(&self, id: TaskId, location: TaskLocation) -> Result<()> {
        let changed = self
            .inner
            .store
            .write()
            .await
            .set_location(&id, location)
            .ok_or(UploadError::TaskNotFound(id))?;

        if changed {
            debug!(task_id = %id, ?location, "Task moved");
            self.emit(UploadEvent::LocationChanged { id, location });
        }
        Ok(())
    }

    /// Pure location flip; an in-flight upload keeps going.
    pub async fn transfer_task_to_background(&self, id: TaskId) -> Result<()> {
        self.set_location(id, TaskLocation::Background).await
    }

    pub async fn transfer_task_to_foreground(&self, id: TaskId) -> Result<()> {
        self.set_location(id, TaskLocation::Foreground).await
    }

    /// Move tasks matching `predicate` to `location` under a single lock.
    async fn move_where(&self, location: TaskLocation, predicate: impl Fn(&UploadTask) -> bool) -> usize {
        let mut store = self.inner.store.write().await;
        let ids = store.ids_where(|task| task.location != location && predicate(task));

        for id in &ids {
            store.set_location(id, location);
            self.emit(UploadEvent::LocationChanged { id: *id, location });
        }
        ids.len()
    }

    pub async fn transfer_all_to_background(&self) -> usize {
        let moved = self.move_where(TaskLocation::Background, |_| true).await;
        info!(moved, "All tasks moved to background");
        moved
    }

    /// Abrupt panel closure: unfinished foreground work keeps running in the background.
    pub async fn close_foreground(&self) -> usize {
        let moved = self
            .move_where(TaskLocation::Background, |task| {
                task.location == TaskLocation::Foreground && task.status.is_active()
            })
            .await;
        info!(moved, "Foreground closed");
        moved
    }

    pub async fn get_task(&self, id: TaskId) -> Option<UploadTask> {
        self.inner.store.read().await.get(&id).cloned()
    }

    pub async fn tasks(&self) -> Vec<UploadTask> {
        self.inner.store.read().await.iter().cloned().collect()
    }

    pub async fn get_tasks_by_location(&self, location: TaskLocation) -> Vec<UploadTask> {
        self.inner
            .store
            .read()
            .await
            .iter()
            .filter(|task| task.location == location)
            .cloned()
            .collect()
    }

    pub async fn get_tasks_by_status(&self, status: UploadStatus) -> Vec<UploadTask> {
        self.inner
            .store
            .read()
            .await
            .iter()
            .filter(|task| task.status == status)
            .cloned()
            .collect()
    }

    pub async fn get_task_stats(&self) -> TaskStats {
        self.inner.store.read().await.stats()
    }

    /// Upload the selected tasks concurrently and return how many completed.
    ///
    /// Without `task_ids`, every pending task at `location` (default
    /// foreground) is selected. One failing task never aborts its siblings.
    #[instrument(skip(self, task_ids))]
    pub async fn start_upload(&self, task_ids: Option<Vec<TaskId>>, location: Option<TaskLocation>) -> usize {
        let location = location.unwrap_or_default();
        let (selected, foreground) = {
            let store = self.inner.store.read().await;
            match task_ids {
                Some(ids) => {
                    let selected: Vec<_> = ids
                        .into_iter()
                        .filter(|id| store.get(id).is_some_and(|task| task.status == UploadStatus::Pending))
                        .collect();
                    let foreground = selected
                        .iter()
                        .filter_map(|id| store.get(id))
                        .any(|task| task.location == TaskLocation::Foreground);
                    (selected, foreground)
                }
                None => (
                    store.ids_where(|task| task.status == UploadStatus::Pending && task.location == location),
                    location == TaskLocation::Foreground,
                ),
            }
        };

        if selected.is_empty() {
            warn!(?location, "No pending tasks to upload");
            self.emit(UploadEvent::NothingToUpload { location });
            return 0;
        }

        let _batch = foreground
            .then(|| ForegroundBatch::enter(&self.inner.foreground_batches));

        let total = selected.len();
        info!(total, ?location, "Upload batch started");

        let results = join_all(selected.into_iter().map(|id| self.run_limited(id))).await;
        let succeeded = results
            .iter()
            .filter(|result| matches!(result, Ok(UploadStatus::Completed)))
            .count();

        info!(total, succeeded, ?location, "Upload batch finished");
        self.emit(UploadEvent::BatchFinished { location, total, succeeded });
        succeeded
    }

    async fn run_limited(&self, id: TaskId) -> Result<UploadStatus> {
        let slot = self.inner.limiter.acquire().await;
        if !slot.is_tracked() {
            warn!(task_id = %id, "Upload slot released without a grant, running unbounded");
        }
        self.upload_single_task(id).await
    }

    /// Transfer one pending task and return the status it settled in.
    ///
    /// Transfer failures are recorded on the task, not returned; `Err` means
    /// the task could not be admitted at all.
    pub async fn upload_single_task(&self, id: TaskId) -> Result<UploadStatus> {
        let cancel = CancellationToken::new();
        let (file, key, checkpoint) = {
            let mut store = self.inner.store.write().await;
            store.admit(&id, cancel.clone())?;
            let task = store.get(&id).ok_or(UploadError::TaskNotFound(id))?;
            (task.file.clone(), task.remote_path.clone(), task.checkpoint.clone())
        };
        self.emit_status(id, UploadStatus::Pending, UploadStatus::Uploading, None);
        self.emit(UploadEvent::Progress { id, progress: 0 });
        info!(task_id = %id, file = %file.name, size = %format_bytes(file.size), "Upload started");

        let result = self.transfer(id, &file, &key, checkpoint, cancel).await;
        Ok(self.settle(id, result).await)
    }

    async fn transfer(
        &self,
        id: TaskId,
        file: &LocalFile,
        key: &str,
        checkpoint: Option<Checkpoint>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let client = self.inner.clients.get_client_with_retry().await?;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let options = TransferOptions {
            part_size: self.inner.config.part_size,
            parallel: self.inner.config.part_concurrency,
            cancel: cancel.clone(),
            checkpoint,
            on_progress: Some(Arc::new(move |fraction: f64, checkpoint: &Checkpoint| {
                let _ = progress_tx.send((fraction, checkpoint.clone()));
            })),
        };

        let mut upload = client.upload_file(file, key, options);
        let result = loop {
            tokio::select! {
                biased;

                Some((fraction, checkpoint)) = progress_rx.recv() => {
                    self.apply_progress(id, fraction, checkpoint).await;
                }
                _ = cancel.cancelled() => break Err(UploadError::Cancelled),
                result = &mut upload => break result,
            }
        };

        while let Ok((fraction, checkpoint)) = progress_rx.try_recv() {
            self.apply_progress(id, fraction, checkpoint).await;
        }
        result
    }

    async fn apply_progress(&self, id: TaskId, fraction: f64, checkpoint: Checkpoint) {
        let progress = self.inner.store.write().await.record_progress(&id, fraction, checkpoint);
        if let Some(progress) = progress {
            self.emit(UploadEvent::Progress { id, progress });
        }
    }

    async fn settle(&self, id: TaskId, result: Result<String>) -> UploadStatus {
        match result {
            Ok(remote_url) => {
                let location = {
                    let mut store = self.inner.store.write().await;
                    store
                        .mark_completed(&id, remote_url)
                        .and_then(|_| store.get(&id).map(|task| task.location))
                };
                let Some(location) = location else {
                    debug!(task_id = %id, "Transfer finished after the task left uploading");
                    return self.current_status(id).await;
                };

                self.emit(UploadEvent::Progress { id, progress: 100 });
                self.emit_status(id, UploadStatus::Uploading, UploadStatus::Completed, None);
                info!(task_id = %id, ?location, "Upload completed");

                if location == TaskLocation::Background {
                    if let Err(err) = self.create_material_for_task(id).await {
                        warn!(task_id = %id, error = %err, "Material creation after background upload failed");
                    }
                }
                UploadStatus::Completed
            }
            Err(err) if err.is_cancelled() => {
                if let Some(from) = self.inner.store.write().await.mark_cancelled(&id) {
                    self.emit_status(id, from, UploadStatus::Cancelled, Some(err.to_string()));
                }
                info!(task_id = %id, "Upload cancelled");
                UploadStatus::Cancelled
            }
            Err(err) => {
                if err.is_auth() {
                    self.inner.clients.clear_cache().await;
                }
                let message = err.to_string();
                if let Some(from) = self.inner.store.write().await.mark_failed(&id, message.clone()) {
                    self.emit_status(id, from, UploadStatus::Error, Some(message));
                }
                error!(task_id = %id, error = %err, "Upload failed");
                self.current_status(id).await
            }
        }
    }

    async fn current_status(&self, id: TaskId) -> UploadStatus {
        self.inner
            .store
            .read()
            .await
            .get(&id)
            .map(|task| task.status)
            .unwrap_or(UploadStatus::Cancelled)
    }

    /// Create the material record for an uploaded task.
    ///
    /// The uploaded object is kept when creation fails.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn create_material_for_task(&self, id: TaskId) -> Result<MaterialId> {
        let (from, task) = self.inner.store.write().await.begin_material(&id)?;
        self.emit(UploadEvent::MaterialStatusChanged {
            id,
            from,
            to: MaterialStatus::Creating,
            error: None,
        });

        let request = material_request(&task)?;
        let result = self.inner.materials.create_material(&request).await;

        let settled = {
            let mut store = self.inner.store.write().await;
            let settled = store.finish_material(&id, &result);
            if settled.as_ref().is_some_and(|settled| settled.remove) {
                store.remove(&id);
            }
            settled
        };

        if let Some(settled) = settled {
            self.emit(UploadEvent::MaterialStatusChanged {
                id,
                from: settled.from,
                to: settled.to,
                error: result.as_ref().err().map(|err| err.to_string()),
            });
            if settled.remove {
                info!(task_id = %id, "Deferred removal applied");
                self.emit(UploadEvent::TaskRemoved { id });
            }
        }

        match result {
            Ok(material_id) => {
                info!(task_id = %id, material_id, "Material created");
                self.inner.refresher.refresh();
                Ok(material_id)
            }
            Err(err) => {
                error!(task_id = %id, error = %err, "Material creation failed");
                Err(err)
            }
        }
    }

    /// Signal the task's transfer and force it to `cancelled`. Safe to repeat.
    pub async fn cancel_task(&self, id: TaskId) {
        let from = self.inner.store.write().await.mark_cancelled(&id);
        if let Some(from) = from {
            info!(task_id = %id, %from, "Task cancelled");
            self.emit_status(id, from, UploadStatus::Cancelled, Some(UploadError::Cancelled.to_string()));
        }
    }

    /// Hard stop for every task.
    pub async fn cancel_all_tasks(&self) -> usize {
        let mut store = self.inner.store.write().await;
        let mut cancelled = 0;

        for id in store.ids_where(|_| true) {
            if let Some(from) = store.mark_cancelled(&id) {
                cancelled += 1;
                self.emit_status(id, from, UploadStatus::Cancelled, Some(UploadError::Cancelled.to_string()));
            }
        }
        info!(cancelled, "All tasks cancelled");
        cancelled
    }

    /// Close the foreground panel on user confirmation.
    ///
    /// Unfinished foreground tasks move to the background, where their
    /// material is created as soon as the bytes land. Completed ones get
    /// their material created now.
    pub async fn confirm_foreground_tasks(&self) -> ConfirmOutcome {
        let (transferred_count, to_create) = {
            let mut store = self.inner.store.write().await;
            let unfinished = store.ids_where(|task| {
                task.location == TaskLocation::Foreground && task.status.is_active()
            });
            for id in &unfinished {
                store.set_location(id, TaskLocation::Background);
                self.emit(UploadEvent::LocationChanged { id: *id, location: TaskLocation::Background });
            }

            let to_create = store.ids_where(|task| {
                task.location == TaskLocation::Foreground
                    && task.status == UploadStatus::Completed
                    && task.material_status == MaterialStatus::Pending
            });
            (unfinished.len(), to_create)
        };

        let results = join_all(to_create.into_iter().map(|id| self.create_material_for_task(id))).await;
        let completed_count = results.iter().filter(|result| result.is_ok()).count();

        info!(completed_count, transferred_count, "Foreground confirmed");
        ConfirmOutcome { completed_count, transferred_count }
    }

    /// Re-admit a failed or cancelled task. Its checkpoint is kept, so the
    /// next upload resumes where the last one stopped.
    pub async fn retry_task(&self, id: TaskId) -> Result<()> {
        let from = self.inner.store.write().await.reset_for_retry(&id)?;
        info!(task_id = %id, %from, "Task queued for retry");
        self.emit_status(id, from, UploadStatus::Pending, None);
        Ok(())
    }

    /// Remove every completed, failed or cancelled task.
    pub async fn clear_finished(&self) -> usize {
        let mut store = self.inner.store.write().await;
        let finished = store.ids_where(|task| {
            task.status.is_terminal() && task.material_status != MaterialStatus::Creating
        });

        for id in &finished {
            store.remove(id);
            self.emit(UploadEvent::TaskRemoved { id: *id });
        }
        debug!(cleared = finished.len(), "Finished tasks cleared");
        finished.len()
    }

    /// Cancel then remove everything; tasks creating a material go once it settles.
    pub async fn clear_all(&self) -> usize {
        self.cancel_all_tasks().await;

        let mut store = self.inner.store.write().await;
        let mut removed = 0;
        for id in store.ids_where(|_| true) {
            let creating = store
                .get(&id)
                .is_some_and(|task| task.material_status == MaterialStatus::Creating);
            if creating {
                store.defer_removal(&id);
                continue;
            }
            store.remove(&id);
            removed += 1;
            self.emit(UploadEvent::TaskRemoved { id });
        }
        info!(removed, "All tasks cleared");
        removed
    }

    /// Create the remote folders implied by the tasks' relative paths under
    /// `root_folder_id` and point every task at its folder.
    ///
    /// Top-level files without a target go to the root. Any folder failure
    /// aborts before a single task is touched.
    #[instrument(skip(self))]
    pub async fn assign_folder_tree(&self, root_folder_id: FolderId) -> Result<HashMap<String, FolderId>> {
        let assignments: Vec<(TaskId, Option<String>)> = {
            let store = self.inner.store.read().await;
            store
                .iter()
                .map(|task| (task.id, task.relative_dir().map(str::to_string)))
                .collect()
        };

        let paths = folder_paths_of(assignments.iter().filter_map(|(_, dir)| dir.as_deref()));
        let folder_ids = FolderMaterializer::new(self.inner.materials.clone())
            .materialize(&paths, root_folder_id)
            .await?;

        let mut store = self.inner.store.write().await;
        for (id, dir) in assignments {
            match dir.and_then(|dir| folder_ids.get(&dir).copied()) {
                Some(folder_id) => {
                    store.set_target_folder(&id, Some(folder_id));
                }
                None => {
                    if store.get(&id).is_some_and(|task| task.target_folder_id.is_none()) {
                        store.set_target_folder(&id, Some(root_folder_id));
                    }
                }
            }
        }

        info!(folders = folder_ids.len(), "Folder tree assigned");
        Ok(folder_ids)
    }
}

fn material_request(task: &UploadTask) -> Result<CreateMaterialRequest> {
    let url = task
        .remote_url
        .clone()
        .ok_or(UploadError::MissingRemoteUrl(task.id))?;
    let ext_info = task
        .relative_path
        .as_ref()
        .map(|path| serde_json::json!({ "relativePath": path }).to_string());

    Ok(CreateMaterialRequest {
        name: task.file.name.clone(),
        url,
        folder_id: task.target_folder_id,
        category: task.category(),
        size: task.file.size,
        mime_type: task.file.mime_type.clone(),
        last_modified: task.file.last_modified.map(|at| at.timestamp_millis()),
        ext_info,
    })
}
