mod errors;
mod file;
mod manager;
mod store;
mod task;
mod types;

pub use errors::{Result, UploadError};
pub use file::LocalFile;
pub use manager::{TaskUpdate, UploadManager};
pub use store::TaskStore;
pub use task::{build_remote_path, UploadTask, UploadTaskBuilder, DEFAULT_PATH_PREFIX};
pub use types::{
    ConfirmOutcome,
    FileCategory,
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
