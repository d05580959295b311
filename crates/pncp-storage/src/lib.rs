//! Storage adapters and HTTP fetch utilities for the PNCP harvester.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

mod http;
#[cfg(feature = "s3")]
mod s3;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition, SimpleTokenBucket,
};
#[cfg(feature = "s3")]
pub use s3::{S3Storage, S3StorageConfig};

pub const CRATE_NAME: &str = "pncp-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage backend error on {path}: {message}")]
    Backend { path: String, message: String },
}

impl StorageError {
    fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return StorageError::NotFound(path.into());
        }
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Uniform object interface over a local directory or an object store.
///
/// Paths are `/`-separated keys relative to the adapter's root. `write`
/// replaces any existing object and never leaves a partially written one.
#[async_trait]
pub trait StorageAdapter: Send + Sync + std::fmt::Debug {
    fn describe(&self) -> String;

    async fn read(&self, path: &str) -> Result<Bytes, StorageError>;

    async fn write(&self, path: &str, bytes: Bytes) -> Result<(), StorageError>;

    /// Every object key under `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let bytes = self.read(from).await?;
        self.write(to, bytes).await
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Filesystem-backed storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageAdapter for LocalStorage {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let absolute = self.resolve(path)?;
        let data = fs::read(&absolute)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        Ok(Bytes::from(data))
    }

    /// Writes through a temp file in the target directory and renames it into place.
    async fn write(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        let absolute = self.resolve(path)?;
        let Some(parent) = absolute.parent() else {
            return Err(StorageError::InvalidPath(path.to_string()));
        };
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent.display().to_string(), e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &absolute).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(path, err));
        }
        debug!(path, bytes = bytes.len(), "stored object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let start = self.resolve(prefix)?;
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::io(dir.display().to_string(), err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io(dir.display().to_string(), e))?
            {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::io(entry.path().display().to_string(), e))?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(key);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let absolute = self.resolve(path)?;
        fs::try_exists(&absolute)
            .await
            .map_err(|e| StorageError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn writes_overwrite_atomically_and_leave_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());

        storage
            .write("raw-data/year=2025/month=08/a.parquet", Bytes::from_static(b"first"))
            .await
            .expect("first write");
        storage
            .write("raw-data/year=2025/month=08/a.parquet", Bytes::from_static(b"second"))
            .await
            .expect("second write");

        let read = storage
            .read("raw-data/year=2025/month=08/a.parquet")
            .await
            .expect("read");
        assert_eq!(&read[..], b"second");

        let month_dir = dir.path().join("raw-data/year=2025/month=08");
        let names = std::fs::read_dir(month_dir)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.parquet".to_string()]);
    }

    #[tokio::test]
    async fn list_is_recursive_sorted_and_prefix_scoped() {
        let dir = tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());
        for key in [
            "raw-data/year=2025/month=09/c.parquet",
            "raw-data/year=2025/month=08/b.parquet",
            "backup/raw-data/year=2025/month=08/b.parquet",
        ] {
            storage.write(key, Bytes::from_static(b"x")).await.expect("write");
        }

        let listed = storage.list("raw-data").await.expect("list");
        assert_eq!(
            listed,
            vec![
                "raw-data/year=2025/month=08/b.parquet".to_string(),
                "raw-data/year=2025/month=09/c.parquet".to_string(),
            ]
        );
        assert!(storage.list("missing").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn missing_objects_and_escaping_paths_are_reported() {
        let dir = tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());

        assert!(!storage.exists("state.json").await.expect("exists"));
        let err = storage.read("state.json").await.unwrap_err();
        assert!(err.is_not_found());
        let err = storage.read("../outside").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn copy_duplicates_bytes() {
        let dir = tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());
        storage.write("a/x", Bytes::from_static(b"data")).await.expect("write");
        storage.copy("a/x", "backup/a/x").await.expect("copy");
        assert_eq!(&storage.read("backup/a/x").await.expect("read")[..], b"data");
    }
}
