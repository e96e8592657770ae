//! Client-side upload task manager: bounded, resumable transfers to object
//! storage followed by material record creation, with foreground and
//! background task queues.

pub mod api;
pub mod config;
pub mod core;
pub mod folders;
pub mod limiter;
pub mod storage;
pub mod utils;

pub use crate::api::{CredentialSource, HttpApi, MaterialApi, MaterialListRefresher, NoopRefresher};
pub use crate::config::UploadConfig;
pub use crate::core::{
    ConfirmOutcome,
    FileCategory,
    FolderId,
    LocalFile,
    MaterialId,
    MaterialStatus,
    RemoveOutcome,
    Result,
    TaskId,
    TaskLocation,
    TaskStats,
    TaskUpdate,
    UploadError,
    UploadEvent,
    UploadManager,
    UploadStatus,
    UploadTask,
};
pub use crate::folders::FolderMaterializer;
pub use crate::limiter::{ConcurrencyLimiter, LimiterRegistry, Slot};
pub use crate::storage::StorageClientManager;
