//! Local filesystem backend
//!
//! Upload data lives in `<upload_dir>/<name>`; the container record is a
//! JSON sidecar at `<upload_dir>/<name>.cachecontainer`. The data file is
//! already the final artifact, so completion needs no merge step.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{fetch_target, ContainerRecord, StoreKind, UploadStore};
use crate::error::{StoreError, StoreResult};
use crate::protocol::{ChecksumAlgorithm, ChecksumSpec};

const CONTAINER_SUFFIX: &str = ".cachecontainer";

/// Read buffer used when hashing whole files
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Filesystem upload store
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    upload_dir: PathBuf,
}

impl FilesystemStore {
    /// Create a store rooted at an existing directory
    pub fn new(upload_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let upload_dir = std::fs::canonicalize(upload_dir.as_ref())?;
        if !upload_dir.is_dir() {
            return Err(StoreError::Backend(format!(
                "Invalid upload directory: {} is not a directory",
                upload_dir.display()
            )));
        }

        Ok(Self { upload_dir })
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.upload_dir.join(name)
    }

    fn container_path(&self, name: &str) -> PathBuf {
        self.upload_dir.join(format!("{}{}", name, CONTAINER_SUFFIX))
    }

    async fn write_container(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        let json = serde_json::to_vec(record)?;
        fs::write(self.container_path(name), json).await?;
        Ok(())
    }
}

#[async_trait]
impl UploadStore for FilesystemStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Filesystem
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(fs::try_exists(self.data_path(name)).await?)
    }

    async fn create(&self, name: &str, record: ContainerRecord) -> StoreResult<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.data_path(name))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StoreError::AlreadyExists(name.to_string()),
                _ => StoreError::Io(e),
            })?;

        self.container_create(name, &record).await
    }

    async fn size(&self, name: &str) -> StoreResult<u64> {
        match fs::metadata(self.data_path(name)).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, name: &str, data: Bytes) -> StoreResult<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.data_path(name))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
                _ => StoreError::Io(e),
            })?;

        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        match fs::remove_file(self.data_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self, name: &str, destination: &Path, remove_after: bool) -> StoreResult<PathBuf> {
        let source = self.data_path(name);
        if !fs::try_exists(&source).await? {
            return Err(StoreError::NotFound(name.to_string()));
        }

        let target = fetch_target(destination, name).await?;
        if fs::canonicalize(destination).await? == self.upload_dir {
            return Ok(source);
        }

        if remove_after {
            fs::rename(&source, &target).await?;
        } else {
            fs::copy(&source, &target).await?;
        }
        Ok(target)
    }

    fn cross_check_algorithms(&self) -> &[ChecksumAlgorithm] {
        &ChecksumAlgorithm::ALL
    }

    async fn cross_check(&self, name: &str, expected: &ChecksumSpec) -> StoreResult<bool> {
        let mut file = fs::File::open(self.data_path(name)).await?;
        let mut hasher = expected.algorithm.hasher();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(hasher.finalize() == expected.value)
    }

    fn is_reserved(&self, name: &str) -> bool {
        name.ends_with(CONTAINER_SUFFIX)
    }

    async fn container_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(fs::try_exists(self.container_path(name)).await?)
    }

    async fn container_create(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        self.write_container(name, record).await
    }

    async fn container_update(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        self.write_container(name, record).await
    }

    async fn container_fetch(&self, name: &str) -> StoreResult<ContainerRecord> {
        let json = fs::read(self.container_path(name)).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(format!("{}{}", name, CONTAINER_SUFFIX)),
            _ => StoreError::Io(e),
        })?;
        Ok(serde_json::from_slice(&json)?)
    }

    async fn container_delete(&self, name: &str) -> StoreResult<()> {
        match fs::remove_file(self.container_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
