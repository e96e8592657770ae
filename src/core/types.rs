use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Remote folder identifier
pub type FolderId = i64;

/// Remote material identifier
pub type MaterialId = i64;

/// Upload task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer status of the raw bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Waiting to be admitted
    Pending,
    /// Bytes are being transferred
    Uploading,
    Completed,
    Error,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Still owed work by some queue.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Uploading)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Status of the metadata record created after the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialStatus {
    Pending,
    Creating,
    Completed,
    Error,
    Cancelled,
}

impl MaterialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for MaterialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Which surface owns a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskLocation {
    /// Blocking upload panel
    #[default]
    Foreground,
    /// Passive notification tray
    Background,
}

/// Category of a material, inferred from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Image,
    Video,
    Audio,
    Other,
}

impl FileCategory {
    const IMAGE: &'static [&'static str] = &["jpg", "jpeg", "png", "gif", "webp", "svg"];
    const VIDEO: &'static [&'static str] = &["mp4", "avi", "mov", "wmv", "flv", "webm"];
    const AUDIO: &'static [&'static str] = &["mp3", "wav", "aac", "ogg", "flac"];

    pub fn from_file_name(name: &str) -> Self {
        let extension = match name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return Self::Other,
        };

        if Self::IMAGE.contains(&extension.as_str()) {
            Self::Image
        } else if Self::VIDEO.contains(&extension.as_str()) {
            Self::Video
        } else if Self::AUDIO.contains(&extension.as_str()) {
            Self::Audio
        } else {
            Self::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Other => "other",
        }
    }
}

/// Task counters partitioned by status and by location
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub uploading: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
    pub foreground: usize,
    pub background: usize,
}

/// Result of confirming the foreground panel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfirmOutcome {
    /// Completed uploads whose material record was created
    pub completed_count: usize,
    /// Unfinished uploads handed over to the background queue
    pub transferred_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Material creation is in flight; the task goes away once it settles
    Deferred,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    TaskAdded {
        id: TaskId,
        location: TaskLocation,
    },

    StatusChanged {
        id: TaskId,
        from: UploadStatus,
        to: UploadStatus,
        error: Option<String>,
    },

    Progress {
        id: TaskId,
        progress: u8,
    },

    MaterialStatusChanged {
        id: TaskId,
        from: MaterialStatus,
        to: MaterialStatus,
        error: Option<String>,
    },

    LocationChanged {
        id: TaskId,
        location: TaskLocation,
    },

    TaskRemoved {
        id: TaskId,
    },

    /// `start_upload` found nothing to do
    NothingToUpload {
        location: TaskLocation,
    },

    BatchFinished {
        location: TaskLocation,
        total: usize,
        succeeded: usize,
    },
}
