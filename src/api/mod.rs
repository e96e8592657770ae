//! Contracts of the REST services the upload core talks to.

mod envelope;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::core::{FileCategory, FolderId, MaterialId, Result};

pub use envelope::{ApiEnvelope, ApiResponse, SUCCESS_CODE};
pub use http::HttpApi;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryCredentials {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub security_token: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantStorageConfig {
    pub region: String,
    pub endpoint: String,
    pub access_key: String,
    #[serde(rename = "secretSecret")]
    pub secret_key: String,
    pub bucket: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMaterialRequest {
    pub name: String,
    pub url: String,
    pub folder_id: Option<FolderId>,
    pub category: FileCategory,
    pub size: u64,
    pub mime_type: String,
    /// Milliseconds since the epoch
    pub last_modified: Option<i64>,
    /// JSON side-channel, currently `{"relativePath": ...}`
    pub ext_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderRequest {
    pub name: String,
    pub parent_id: FolderId,
    pub is_public: bool,
    /// Storage-path placeholder the remote schema requires on every folder
    pub vector_index: String,
}

/// `data` payload of the create endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedRecord {
    pub id: i64,
}

/// Short-lived credential exchange.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn temporary_credentials(&self) -> Result<TemporaryCredentials>;

    async fn tenant_storage_config(&self) -> Result<TenantStorageConfig>;
}

/// Material and folder record creation.
#[async_trait]
pub trait MaterialApi: Send + Sync {
    async fn create_material(&self, request: &CreateMaterialRequest) -> Result<MaterialId>;

    async fn create_folder(&self, request: &CreateFolderRequest) -> Result<FolderId>;
}

/// Fire-and-forget hint that the material list should be fetched again.
pub trait MaterialListRefresher: Send + Sync {
    fn refresh(&self);
}

pub struct NoopRefresher;

impl MaterialListRefresher for NoopRefresher {
    fn refresh(&self) {}
}
