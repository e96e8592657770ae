use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;
use crate::core::{FolderId, MaterialId, Result, UploadError};
use super::envelope::ApiEnvelope;
use super::{
    CreateFolderRequest,
    CreateMaterialRequest,
    CreatedRecord,
    CredentialSource,
    MaterialApi,
    TemporaryCredentials,
    TenantStorageConfig,
};

const CREDENTIALS_PATH: &str = "api/storage/sts-token";
const STORAGE_CONFIG_PATH: &str = "api/storage/tenant-config";
const CREATE_MATERIAL_PATH: &str = "api/material/create";
const CREATE_FOLDER_PATH: &str = "api/folder/create";

/// reqwest-backed implementation of the REST collaborators.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        // `join` drops the last segment unless the base ends with a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client: Client::new(),
            base_url,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|err| UploadError::internal(format!("Invalid token header: {}", err)))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!(%url, "GET");

        let response = self
            .client
            .get(url)
            .headers(self.create_headers()?)
            .send()
            .await?;

        Self::read_envelope(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!(%url, "POST");

        let response = self
            .client
            .post(url)
            .headers(self.create_headers()?)
            .json(body)
            .send()
            .await?;

        Self::read_envelope(response).await
    }

    async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UploadError::Auth(format!("request rejected with status {}", status)));
        }
        if !status.is_success() {
            return Err(UploadError::api(status.as_u16() as i32, format!("unexpected status {}", status)));
        }

        let envelope: ApiEnvelope<T> = response.json().await?;
        envelope.into_result()
    }
}

#[async_trait]
impl CredentialSource for HttpApi {
    async fn temporary_credentials(&self) -> Result<TemporaryCredentials> {
        self.get(CREDENTIALS_PATH).await
    }

    async fn tenant_storage_config(&self) -> Result<TenantStorageConfig> {
        self.get(STORAGE_CONFIG_PATH).await
    }
}

#[async_trait]
impl MaterialApi for HttpApi {
    async fn create_material(&self, request: &CreateMaterialRequest) -> Result<MaterialId> {
        let record: CreatedRecord = self.post(CREATE_MATERIAL_PATH, request).await?;
        Ok(record.id)
    }

    async fn create_folder(&self, request: &CreateFolderRequest) -> Result<FolderId> {
        let record: CreatedRecord = self.post(CREATE_FOLDER_PATH, request).await?;
        Ok(record.id)
    }
}
