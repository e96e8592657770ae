use std::path::Path;
use std::time::Duration;
use anyhow::Context;
use serde::Deserialize;
use crate::storage::{DEFAULT_PART_CONCURRENCY, DEFAULT_PART_SIZE};

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UploadConfig {
    /// Whole-file transfers running at once
    pub max_concurrent_uploads: usize,
    /// Bytes per multipart part
    pub part_size: u64,
    /// Parts of one file in flight at once
    pub part_concurrency: usize,
    /// Seconds a storage client is reused
    pub client_cache_duration: u64,
    pub remote_path_prefix: String,
    pub event_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 3,
            part_size: DEFAULT_PART_SIZE,
            part_concurrency: DEFAULT_PART_CONCURRENCY,
            client_cache_duration: 45 * 60,
            remote_path_prefix: "materials".to_string(),
            event_capacity: 256,
        }
    }
}

impl UploadConfig {
    pub fn from_toml_str(config_str: &str) -> anyhow::Result<Self> {
        toml::from_str(config_str).context("Can't parse upload config")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&config_str)
    }

    pub fn cache_duration(&self) -> Duration {
        Duration::from_secs(self.client_cache_duration)
    }
}
