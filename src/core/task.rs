use chrono::{DateTime, Utc};
use crate::storage::Checkpoint;
use super::file::LocalFile;
use super::types::{
    FileCategory,
    FolderId,
    MaterialId,
    MaterialStatus,
    TaskId,
    TaskLocation,
    UploadStatus,
};

pub const DEFAULT_PATH_PREFIX: &str = "materials";

/// One file's journey from local selection to uploaded object plus material record.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: TaskId,
    pub file: LocalFile,
    /// Path inside a dragged-in folder tree, e.g. `docs/img/a.png`
    pub relative_path: Option<String>,
    pub target_folder_id: Option<FolderId>,
    /// Storage key, fixed at creation
    pub remote_path: String,
    pub status: UploadStatus,
    pub progress: u8,
    pub location: TaskLocation,
    pub remote_url: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    pub material_status: MaterialStatus,
    pub material_id: Option<MaterialId>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadTask {
    pub fn builder(file: LocalFile) -> UploadTaskBuilder {
        UploadTaskBuilder::new(file)
    }

    pub fn new(file: LocalFile, location: TaskLocation) -> Self {
        Self::builder(file).location(location).build()
    }

    pub fn category(&self) -> FileCategory {
        FileCategory::from_file_name(&self.file.name)
    }

    /// Progress as displayed; a pending task has none.
    pub fn effective_progress(&self) -> u8 {
        match self.status {
            UploadStatus::Pending => 0,
            _ => self.progress,
        }
    }

    /// Parent folder part of the relative path, `None` for top-level files.
    pub fn relative_dir(&self) -> Option<&str> {
        self.relative_path
            .as_deref()
            .and_then(|path| path.rsplit_once('/'))
            .map(|(dir, _)| dir)
            .filter(|dir| !dir.is_empty())
    }
}

pub struct UploadTaskBuilder {
    file: LocalFile,
    relative_path: Option<String>,
    target_folder_id: Option<FolderId>,
    location: TaskLocation,
    path_prefix: String,
}

impl UploadTaskBuilder {
    pub fn new(file: LocalFile) -> Self {
        Self {
            file,
            relative_path: None,
            target_folder_id: None,
            location: TaskLocation::Foreground,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
        }
    }

    pub fn relative_path(mut self, relative_path: impl Into<String>) -> Self {
        let relative_path = normalize_relative_path(&relative_path.into());
        self.relative_path = (!relative_path.is_empty()).then_some(relative_path);
        self
    }

    pub fn target_folder(mut self, folder_id: FolderId) -> Self {
        self.target_folder_id = Some(folder_id);
        self
    }

    pub fn location(mut self, location: TaskLocation) -> Self {
        self.location = location;
        self
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    pub fn build(self) -> UploadTask {
        let id = TaskId::new();
        let now = Utc::now();
        let remote_path = build_remote_path(
            &self.path_prefix,
            &id,
            now,
            self.relative_path.as_deref().unwrap_or(&self.file.name),
        );

        UploadTask {
            id,
            file: self.file,
            relative_path: self.relative_path,
            target_folder_id: self.target_folder_id,
            remote_path,
            status: UploadStatus::Pending,
            progress: 0,
            location: self.location,
            remote_url: None,
            checkpoint: None,
            material_status: MaterialStatus::Pending,
            material_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

fn normalize_relative_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// `<prefix>/<yyyymmdd>/<task id>/<relative path or file name>`
pub fn build_remote_path(prefix: &str, id: &TaskId, created_at: DateTime<Utc>, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = normalize_relative_path(name);
    let date = created_at.format("%Y%m%d");

    if prefix.is_empty() {
        format!("{}/{}/{}", date, id, name)
    } else {
        format!("{}/{}/{}/{}", prefix, date, id, name)
    }
}
