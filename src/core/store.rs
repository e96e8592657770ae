use std::collections::HashMap;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use crate::storage::Checkpoint;
use super::errors::{Result, UploadError};
use super::task::UploadTask;
use super::types::{
    FolderId,
    MaterialId,
    MaterialStatus,
    TaskId,
    TaskLocation,
    TaskStats,
    UploadStatus,
};

pub(crate) struct TaskEntry {
    pub(crate) task: UploadTask,
    /// Present exactly while the task is uploading
    pub(crate) cancel: Option<CancellationToken>,
    /// Removal requested while the material record was being created
    pub(crate) remove_when_settled: bool,
}

/// Outcome of settling a material creation
pub(crate) struct MaterialSettled {
    pub(crate) from: MaterialStatus,
    pub(crate) to: MaterialStatus,
    pub(crate) remove: bool,
}

/// Id-addressed task arena; keeps insertion order for listing.
#[derive(Default)]
pub struct TaskStore {
    entries: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: UploadTask) -> TaskId {
        let id = task.id;
        if self.entries.insert(id, TaskEntry { task, cancel: None, remove_when_settled: false }).is_none() {
            self.order.push(id);
        }
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&UploadTask> {
        self.entries.get(id).map(|entry| &entry.task)
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, id: &TaskId) -> Option<&TaskEntry> {
        self.entries.get(id)
    }

    /// Tasks in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &UploadTask> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| &entry.task)
    }

    pub fn ids_where(&self, predicate: impl Fn(&UploadTask) -> bool) -> Vec<TaskId> {
        self.iter().filter(|task| predicate(task)).map(|task| task.id).collect()
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<UploadTask> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|x| x != id);
        Some(entry.task)
    }

    /// The single mutation primitive; every change goes through here and
    /// refreshes `updated_at`.
    pub(crate) fn update<R>(&mut self, id: &TaskId, f: impl FnOnce(&mut TaskEntry) -> R) -> Option<R> {
        let entry = self.entries.get_mut(id)?;
        let result = f(entry);
        entry.task.updated_at = Utc::now();
        Some(result)
    }

    /// Pending -> uploading, taking ownership of the cancellation token.
    pub fn admit(&mut self, id: &TaskId, cancel: CancellationToken) -> Result<()> {
        self.update(id, |entry| {
            if entry.task.status != UploadStatus::Pending {
                return Err(UploadError::InvalidState {
                    id: *id,
                    action: "start uploading",
                    state: entry.task.status.to_string(),
                });
            }
            entry.task.status = UploadStatus::Uploading;
            entry.task.progress = 0;
            entry.task.error = None;
            entry.cancel = Some(cancel);
            Ok(())
        })
        .unwrap_or(Err(UploadError::TaskNotFound(*id)))
    }

    /// Apply a progress report. Returns the new percentage when it grew.
    pub fn record_progress(&mut self, id: &TaskId, fraction: f64, checkpoint: Checkpoint) -> Option<u8> {
        self.update(id, |entry| {
            if entry.task.status != UploadStatus::Uploading {
                return None;
            }
            entry.task.checkpoint = Some(checkpoint);

            let percent = (fraction.clamp(0.0, 1.0) * 100.0).floor() as u8;
            if percent > entry.task.progress {
                entry.task.progress = percent;
                Some(percent)
            } else {
                None
            }
        })
        .flatten()
    }

    /// Uploading -> completed. `None` if the task left `uploading` meanwhile.
    pub fn mark_completed(&mut self, id: &TaskId, remote_url: String) -> Option<UploadStatus> {
        self.update(id, |entry| {
            if entry.task.status != UploadStatus::Uploading {
                return None;
            }
            entry.cancel = None;
            entry.task.status = UploadStatus::Completed;
            entry.task.progress = 100;
            entry.task.remote_url = Some(remote_url);
            entry.task.error = None;
            Some(UploadStatus::Uploading)
        })
        .flatten()
    }

    /// Uploading -> error
    pub fn mark_failed(&mut self, id: &TaskId, message: String) -> Option<UploadStatus> {
        self.update(id, |entry| {
            if entry.task.status != UploadStatus::Uploading {
                return None;
            }
            entry.cancel = None;
            entry.task.status = UploadStatus::Error;
            entry.task.error = Some(message);
            Some(UploadStatus::Uploading)
        })
        .flatten()
    }

    /// Signal the task's transfer (if any) and force it to `cancelled`.
    ///
    /// Completed tasks keep their status so `remote_url` stays meaningful.
    /// Returns the previous status when it changed.
    pub fn mark_cancelled(&mut self, id: &TaskId) -> Option<UploadStatus> {
        self.update(id, |entry| {
            if let Some(cancel) = entry.cancel.take() {
                cancel.cancel();
            }

            let from = entry.task.status;
            if matches!(from, UploadStatus::Completed | UploadStatus::Cancelled) {
                return None;
            }
            entry.task.status = UploadStatus::Cancelled;
            entry.task.error = Some(UploadError::Cancelled.to_string());
            Some(from)
        })
        .flatten()
    }

    /// Explicit user retry: error/cancelled -> pending. The checkpoint is kept.
    pub fn reset_for_retry(&mut self, id: &TaskId) -> Result<UploadStatus> {
        self.update(id, |entry| {
            let from = entry.task.status;
            if !matches!(from, UploadStatus::Error | UploadStatus::Cancelled) {
                return Err(UploadError::InvalidState {
                    id: *id,
                    action: "retry",
                    state: from.to_string(),
                });
            }
            entry.task.status = UploadStatus::Pending;
            entry.task.progress = 0;
            entry.task.error = None;
            Ok(from)
        })
        .unwrap_or(Err(UploadError::TaskNotFound(*id)))
    }

    /// Returns whether the location actually changed.
    pub fn set_location(&mut self, id: &TaskId, location: TaskLocation) -> Option<bool> {
        self.update(id, |entry| {
            let changed = entry.task.location != location;
            entry.task.location = location;
            changed
        })
    }

    /// Gate and start material creation. Returns the previous material status
    /// and a snapshot to build the request from.
    pub fn begin_material(&mut self, id: &TaskId) -> Result<(MaterialStatus, UploadTask)> {
        self.update(id, |entry| {
            let task = &mut entry.task;
            if task.remote_url.is_none() || task.status != UploadStatus::Completed {
                return Err(UploadError::MissingRemoteUrl(*id));
            }
            if !matches!(task.material_status, MaterialStatus::Pending | MaterialStatus::Error) {
                return Err(UploadError::InvalidState {
                    id: *id,
                    action: "create material",
                    state: format!("material {}", task.material_status),
                });
            }
            let from = task.material_status;
            task.material_status = MaterialStatus::Creating;
            task.error = None;
            Ok((from, task.clone()))
        })
        .unwrap_or(Err(UploadError::TaskNotFound(*id)))
    }

    pub(crate) fn finish_material(&mut self, id: &TaskId, result: &Result<MaterialId>) -> Option<MaterialSettled> {
        self.update(id, |entry| {
            let from = entry.task.material_status;
            match result {
                Ok(material_id) => {
                    entry.task.material_status = MaterialStatus::Completed;
                    entry.task.material_id = Some(*material_id);
                }
                Err(err) => {
                    entry.task.material_status = MaterialStatus::Error;
                    entry.task.error = Some(err.to_string());
                }
            }
            MaterialSettled {
                from,
                to: entry.task.material_status,
                remove: entry.remove_when_settled,
            }
        })
    }

    pub fn set_target_folder(&mut self, id: &TaskId, folder_id: Option<FolderId>) -> bool {
        self.update(id, |entry| entry.task.target_folder_id = folder_id).is_some()
    }

    pub(crate) fn defer_removal(&mut self, id: &TaskId) -> bool {
        self.update(id, |entry| entry.remove_when_settled = true).is_some()
    }

    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats::default();
        for task in self.iter() {
            stats.total += 1;
            match task.status {
                UploadStatus::Pending => stats.pending += 1,
                UploadStatus::Uploading => stats.uploading += 1,
                UploadStatus::Completed => stats.completed += 1,
                UploadStatus::Error => stats.error += 1,
                UploadStatus::Cancelled => stats.cancelled += 1,
            }
            match task.location {
                TaskLocation::Foreground => stats.foreground += 1,
                TaskLocation::Background => stats.background += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file::LocalFile;

    fn task(location: TaskLocation) -> UploadTask {
        UploadTask::new(LocalFile::from_bytes("a.png", vec![1u8; 8]), location)
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint::new("k", "u", 8, 4)
    }

    #[test]
    fn test_lifecycle() {
        let mut store = TaskStore::new();
        let id = store.insert(task(TaskLocation::Foreground));
        let token = CancellationToken::new();

        store.admit(&id, token.clone()).unwrap();
        assert!(store.admit(&id, CancellationToken::new()).is_err());

        assert_eq!(store.record_progress(&id, 0.5, checkpoint()), Some(50));
        assert_eq!(store.record_progress(&id, 0.25, checkpoint()), None);
        assert_eq!(store.get(&id).unwrap().progress, 50);

        assert_eq!(store.mark_completed(&id, "memory://x".into()), Some(UploadStatus::Uploading));
        let done = store.get(&id).unwrap();
        assert_eq!(done.progress, 100);
        assert_eq!(done.remote_url.as_deref(), Some("memory://x"));
        assert!(store.entry(&id).unwrap().cancel.is_none());

        // Completed tasks are not cancelled afterwards
        assert_eq!(store.mark_cancelled(&id), None);
        assert_eq!(store.get(&id).unwrap().status, UploadStatus::Completed);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_signals_token() {
        let mut store = TaskStore::new();
        let id = store.insert(task(TaskLocation::Background));
        let token = CancellationToken::new();
        store.admit(&id, token.clone()).unwrap();

        assert_eq!(store.mark_cancelled(&id), Some(UploadStatus::Uploading));
        assert!(token.is_cancelled());
        assert_eq!(store.mark_cancelled(&id), None);

        let cancelled = store.get(&id).unwrap();
        assert_eq!(cancelled.status, UploadStatus::Cancelled);
        assert_eq!(cancelled.error.as_deref(), Some("upload cancelled"));
        // A late failure report does not override the cancellation
        assert_eq!(store.mark_failed(&id, "late".into()), None);
    }

    #[test]
    fn test_retry_keeps_checkpoint() {
        let mut store = TaskStore::new();
        let id = store.insert(task(TaskLocation::Foreground));
        store.admit(&id, CancellationToken::new()).unwrap();
        store.record_progress(&id, 0.5, checkpoint());
        store.mark_failed(&id, "reset by peer".into());

        assert_eq!(store.reset_for_retry(&id).unwrap(), UploadStatus::Error);
        let retried = store.get(&id).unwrap();
        assert_eq!(retried.status, UploadStatus::Pending);
        assert!(retried.error.is_none());
        assert!(retried.checkpoint.is_some());
        assert!(store.reset_for_retry(&id).is_err());
    }

    #[test]
    fn test_transitions_follow_mutations() {
        let mut store = TaskStore::new();
        let id = store.insert(task(TaskLocation::Foreground));

        // Nothing but admission leaves pending towards a result
        assert_eq!(store.mark_completed(&id, "memory://a.png".into()), None);
        assert_eq!(store.mark_failed(&id, "boom".into()), None);
        assert!(store.reset_for_retry(&id).is_err());

        store.admit(&id, CancellationToken::new()).unwrap();
        store.mark_failed(&id, "boom".into());
        assert!(store.admit(&id, CancellationToken::new()).is_err());

        // A failed task may still be cancelled, and either way retried
        assert_eq!(store.mark_cancelled(&id), Some(UploadStatus::Error));
        assert_eq!(store.reset_for_retry(&id).unwrap(), UploadStatus::Cancelled);
        assert_eq!(store.get(&id).unwrap().status, UploadStatus::Pending);
    }

    #[test]
    fn test_material_gate() {
        let mut store = TaskStore::new();
        let id = store.insert(task(TaskLocation::Foreground));
        assert!(matches!(store.begin_material(&id), Err(UploadError::MissingRemoteUrl(_))));

        store.admit(&id, CancellationToken::new()).unwrap();
        store.mark_completed(&id, "memory://a.png".into());
        store.begin_material(&id).unwrap();
        assert!(matches!(store.begin_material(&id), Err(UploadError::InvalidState { .. })));

        let settled = store.finish_material(&id, &Ok(9)).unwrap();
        assert_eq!(settled.to, MaterialStatus::Completed);
        assert!(!settled.remove);
        assert_eq!(store.get(&id).unwrap().material_id, Some(9));
    }

    #[test]
    fn test_stats_and_order() {
        let mut store = TaskStore::new();
        let a = store.insert(task(TaskLocation::Foreground));
        let b = store.insert(task(TaskLocation::Background));
        let c = store.insert(task(TaskLocation::Background));
        store.admit(&b, CancellationToken::new()).unwrap();
        store.mark_cancelled(&c);

        let stats = store.stats();
        assert_eq!(stats, TaskStats {
            total: 3,
            pending: 1,
            uploading: 1,
            completed: 0,
            error: 0,
            cancelled: 1,
            foreground: 1,
            background: 2,
        });

        let ids: Vec<_> = store.iter().map(|task| task.id).collect();
        assert_eq!(ids, vec![a, b, c]);
        store.remove(&b);
        assert_eq!(store.ids_where(|_| true), vec![a, c]);
    }
}
