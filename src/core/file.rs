use std::path::{Path, PathBuf};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use super::errors::{Result, UploadError};

#[derive(Debug, Clone)]
enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// Handle to a local payload selected for upload.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub last_modified: Option<DateTime<Utc>>,
    source: FileSource,
}

impl LocalFile {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Not a file: {}", path.display()),
            )));
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        Ok(Self {
            mime_type: guess_mime(&name),
            name,
            size: metadata.len(),
            last_modified,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let data = data.into();

        Self {
            mime_type: guess_mime(&name),
            size: data.len() as u64,
            last_modified: None,
            source: FileSource::Memory(data),
            name,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    /// Read `len` bytes starting at `offset`, clamped to the end of the file.
    pub async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes> {
        if offset >= self.size {
            return Ok(Bytes::new());
        }
        let len = len.min((self.size - offset) as usize);

        match &self.source {
            FileSource::Memory(data) => {
                let start = offset as usize;
                Ok(data.slice(start..start + len))
            }
            FileSource::Path(path) => {
                let mut file = File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;

                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}

fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_ranges() {
        let file = LocalFile::from_bytes("clip.mp4", vec![1u8, 2, 3, 4, 5]);
        assert_eq!(file.size, 5);
        assert_eq!(file.mime_type, "video/mp4");

        assert_eq!(file.read_range(1, 2).await.unwrap().as_ref(), &[2, 3]);
        assert_eq!(file.read_range(3, 10).await.unwrap().as_ref(), &[4, 5]);
        assert!(file.read_range(5, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_path_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let file = LocalFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.size, 11);
        assert!(file.last_modified.is_some());
        assert_eq!(file.read_range(6, 5).await.unwrap().as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalFile::from_path(dir.path()).await.is_err());
    }
}
