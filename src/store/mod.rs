//! Upload storage backends
//!
//! Every backend implements [`UploadStore`], the full capability set the
//! protocol engine needs: resource existence, size, ordered append, delete,
//! the container metadata sub-contract and checksum-capability negotiation.
//!
//! Backends:
//! - `filesystem`: data file plus `.cachecontainer` sidecar
//! - `s3`: multipart upload sessions finalized on completion
//! - `gridfs`: one stored chunk per append, merged on completion
//! - `keyvalue`: a single expiring blob per upload

pub mod filesystem;
pub mod gridfs;
pub mod keyvalue;
pub mod s3;
mod s3_client;
mod types;

#[cfg(feature = "mongodb")]
mod mongo;
#[cfg(feature = "redis")]
mod redis_client;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{StoreError, StoreResult};
use crate::protocol::{ChecksumAlgorithm, ChecksumSpec};

pub use filesystem::FilesystemStore;
pub use gridfs::{ChunkBucket, ChunkReader, ChunkWriter, DocumentStore, StoredChunk, STREAM_BUFFER_SIZE};
pub use keyvalue::{KeyValueClient, KeyValueStore, MemoryKeyValue};
pub use s3::{ObjectClient, ObjectStore, PartSummary};
pub use s3_client::S3Client;
pub use types::*;

#[cfg(feature = "mongodb")]
pub use mongo::GridFsBucket;
#[cfg(feature = "redis")]
pub use redis_client::RedisClient;

/// Storage contract for resumable uploads
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Which backend this is (for logging only)
    fn kind(&self) -> StoreKind;

    /// Whether the upload resource exists
    async fn exists(&self, name: &str) -> StoreResult<bool>;

    /// Create an empty resource together with its container record
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the name is taken.
    async fn create(&self, name: &str, record: ContainerRecord) -> StoreResult<()>;

    /// Bytes currently stored for the upload
    async fn size(&self, name: &str) -> StoreResult<u64>;

    /// Append a chunk to the end of the upload
    async fn append(&self, name: &str, data: Bytes) -> StoreResult<()>;

    /// Remove the upload data
    async fn delete(&self, name: &str) -> StoreResult<()>;

    /// Backend-specific completion step
    ///
    /// Called once, after the container record has been destroyed. `record`
    /// is the last persisted state of that container.
    async fn complete(&self, _name: &str, _record: &ContainerRecord) -> StoreResult<()> {
        Ok(())
    }

    /// Materialize a finished upload as `<destination>/<name>`
    async fn fetch(&self, name: &str, destination: &Path, remove_after: bool)
        -> StoreResult<PathBuf>;

    /// Whether whole-file verification is available at all
    fn supports_cross_check(&self) -> bool {
        !self.cross_check_algorithms().is_empty()
    }

    /// Algorithms accepted for whole-file verification
    fn cross_check_algorithms(&self) -> &[ChecksumAlgorithm] {
        &[]
    }

    /// Compare the stored upload against `expected`
    async fn cross_check(&self, _name: &str, _expected: &ChecksumSpec) -> StoreResult<bool> {
        Err(StoreError::Unsupported(self.kind().as_str()))
    }

    /// Whether `name` falls in the namespace this backend keeps container
    /// records in. Such names are refused as upload names.
    fn is_reserved(&self, _name: &str) -> bool {
        false
    }

    async fn container_exists(&self, name: &str) -> StoreResult<bool>;

    async fn container_create(&self, name: &str, record: &ContainerRecord) -> StoreResult<()>;

    async fn container_update(&self, name: &str, record: &ContainerRecord) -> StoreResult<()>;

    async fn container_fetch(&self, name: &str) -> StoreResult<ContainerRecord>;

    /// Remove the container record; a missing record is not an error
    async fn container_delete(&self, name: &str) -> StoreResult<()>;
}

/// Destination path for `fetch`, creating the directory if needed
pub(crate) async fn fetch_target(destination: &Path, name: &str) -> StoreResult<PathBuf> {
    tokio::fs::create_dir_all(destination).await?;
    Ok(destination.join(name))
}
