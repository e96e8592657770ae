use thiserror::Error;
use super::types::TaskId;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend answered with a non-success envelope
    #[error("API error {code}: {msg}")]
    Api {
        code: i32,
        msg: String,
    },

    #[error("Authorization failed: {0}")]
    Auth(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The store no longer knows the multipart upload id (aborted or expired)
    #[error("Multipart upload {0} no longer exists")]
    UploadExpired(String),

    #[error("upload cancelled")]
    Cancelled,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {0} has no remote url")]
    MissingRemoteUrl(TaskId),

    #[error("Task {id} cannot {action} while {state}")]
    InvalidState {
        id: TaskId,
        action: &'static str,
        state: String,
    },

    #[error("Failed to create folder '{path}': {source}")]
    Folder {
        path: String,
        #[source]
        source: Box<UploadError>,
    },

    #[error("Invalid checkpoint: {0}")]
    Checkpoint(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn api(code: i32, msg: impl Into<String>) -> Self {
        Self::Api {
            code,
            msg: msg.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_upload_expired(&self) -> bool {
        matches!(self, Self::UploadExpired(_))
    }

    /// Errors after which a cached storage client must not be reused.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Auth(_) => true,
            Self::Api { code, .. } => *code == 401 || *code == 403,
            Self::Http(err) => err
                .status()
                .is_some_and(|status| status.as_u16() == 401 || status.as_u16() == 403),
            _ => false,
        }
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
