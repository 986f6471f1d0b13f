//! Chunked document-store backend (GridFS style)
//!
//! The document store cannot append to a stored file, so every append is
//! saved as its own chunk object under the upload name, tagged with a
//! sequence number. The upload offset is the sum of chunk lengths, and
//! completion merges the chunks back into a single object.
//!
//! The container record is an empty chunk named `container.<name>` whose
//! metadata holds the record.
//!
//! Chunk contents are never held in memory whole: reads and writes go
//! through [`ChunkReader`] and [`ChunkWriter`] in bounded slices.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use super::{fetch_target, ContainerRecord, Continuation, StoreKind, UploadStore};
use crate::error::{StoreError, StoreResult};

pub(crate) const CONTAINER_PREFIX: &str = "container.";

/// Largest slice read from a stored chunk at once
pub const STREAM_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// A stored chunk as listed by the bucket
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub id: String,
    pub length: u64,
    pub metadata: serde_json::Value,
}

impl StoredChunk {
    fn sequence(&self) -> u64 {
        self.metadata.get("sequence").and_then(|s| s.as_u64()).unwrap_or(0)
    }
}

/// Sequential reader over one stored chunk
#[async_trait]
pub trait ChunkReader: Send {
    /// Next slice of at most [`STREAM_BUFFER_SIZE`] bytes, `None` at the end
    async fn next_slice(&mut self) -> StoreResult<Option<Bytes>>;
}

/// Sequential writer producing one new chunk
#[async_trait]
pub trait ChunkWriter: Send {
    async fn write(&mut self, data: &[u8]) -> StoreResult<()>;

    /// Seal the chunk, returning its id. Nothing is visible before this.
    async fn finish(self: Box<Self>) -> StoreResult<String>;
}

/// Operations on a bucket of named, immutable chunk files
#[async_trait]
pub trait ChunkBucket: Send + Sync {
    /// Store a new chunk, returning its id
    async fn put(&self, filename: &str, data: Bytes, metadata: serde_json::Value) -> StoreResult<String>;

    /// All chunks stored under `filename`
    async fn find(&self, filename: &str) -> StoreResult<Vec<StoredChunk>>;

    async fn open(&self, id: &str) -> StoreResult<Box<dyn ChunkReader>>;

    /// Start a new chunk written in slices
    async fn create(&self, filename: &str, metadata: serde_json::Value) -> StoreResult<Box<dyn ChunkWriter>>;

    async fn remove(&self, id: &str) -> StoreResult<()>;
}

/// Document store backend
pub struct DocumentStore<B> {
    bucket: B,
    merge_on_complete: bool,
}

impl<B: ChunkBucket> DocumentStore<B> {
    pub fn new(bucket: B) -> Self {
        Self {
            bucket,
            merge_on_complete: true,
        }
    }

    /// Whether completion re-stores the upload as a single chunk
    pub fn with_merge_on_complete(mut self, merge: bool) -> Self {
        self.merge_on_complete = merge;
        self
    }

    fn container_name(name: &str) -> String {
        format!("{}{}", CONTAINER_PREFIX, name)
    }

    /// Chunks of an upload in submission order
    async fn chunks(&self, name: &str) -> StoreResult<Vec<StoredChunk>> {
        let mut chunks = self.bucket.find(name).await?;
        chunks.sort_by_key(StoredChunk::sequence);
        Ok(chunks)
    }

    async fn remove_all(&self, chunks: &[StoredChunk]) -> StoreResult<()> {
        for chunk in chunks {
            self.bucket.remove(&chunk.id).await?;
        }
        Ok(())
    }

    /// Concatenate every chunk into one object stored under the same name
    async fn merge(&self, name: &str) -> StoreResult<()> {
        let chunks = self.chunks(name).await?;
        if chunks.len() <= 1 {
            return Ok(());
        }

        let next = chunks.last().map(|c| c.sequence() + 1).unwrap_or(0);
        let mut writer = self.bucket.create(name, json!({ "sequence": next })).await?;
        for chunk in &chunks {
            let mut reader = self.bucket.open(&chunk.id).await?;
            while let Some(slice) = reader.next_slice().await? {
                writer.write(&slice).await?;
            }
        }
        writer.finish().await?;
        self.remove_all(&chunks).await?;

        tracing::debug!(name = %name, chunks = chunks.len(), "Merged chunks");
        Ok(())
    }
}

#[async_trait]
impl<B: ChunkBucket> UploadStore for DocumentStore<B> {
    fn kind(&self) -> StoreKind {
        StoreKind::DocumentStore
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(!self.bucket.find(name).await?.is_empty())
    }

    async fn create(&self, name: &str, mut record: ContainerRecord) -> StoreResult<()> {
        if self.exists(name).await? {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }

        // An empty first chunk makes the upload discoverable before any data arrives
        self.bucket.put(name, Bytes::new(), json!({ "sequence": 0 })).await?;
        record.continuation = Continuation::Chunked { chunks: 0 };
        self.container_create(name, &record).await
    }

    async fn size(&self, name: &str) -> StoreResult<u64> {
        let chunks = self.bucket.find(name).await?;
        if chunks.is_empty() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(chunks.iter().map(|c| c.length).sum())
    }

    async fn append(&self, name: &str, data: Bytes) -> StoreResult<()> {
        let mut record = self.container_fetch(name).await?;
        let sequence = match record.continuation {
            Continuation::Chunked { chunks } => chunks + 1,
            _ => self.chunks(name).await?.last().map(|c| c.sequence() + 1).unwrap_or(1),
        };

        self.bucket.put(name, data, json!({ "sequence": sequence })).await?;

        record.continuation = Continuation::Chunked { chunks: sequence };
        self.container_update(name, &record).await
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        let chunks = self.bucket.find(name).await?;
        self.remove_all(&chunks).await
    }

    async fn complete(&self, name: &str, _record: &ContainerRecord) -> StoreResult<()> {
        if self.merge_on_complete {
            self.merge(name).await?;
        }
        self.container_delete(name).await
    }

    async fn fetch(&self, name: &str, destination: &Path, remove_after: bool) -> StoreResult<PathBuf> {
        let chunks = self.chunks(name).await?;
        if chunks.is_empty() {
            return Err(StoreError::NotFound(name.to_string()));
        }

        let target = fetch_target(destination, name).await?;
        let mut file = tokio::fs::File::create(&target).await?;
        for chunk in &chunks {
            let mut reader = self.bucket.open(&chunk.id).await?;
            while let Some(slice) = reader.next_slice().await? {
                file.write_all(&slice).await?;
            }
            if remove_after {
                self.bucket.remove(&chunk.id).await?;
            }
        }
        file.flush().await?;

        if remove_after {
            self.container_delete(name).await?;
        }
        Ok(target)
    }

    fn is_reserved(&self, name: &str) -> bool {
        name.starts_with(CONTAINER_PREFIX)
    }

    async fn container_exists(&self, name: &str) -> StoreResult<bool> {
        self.exists(&Self::container_name(name)).await
    }

    async fn container_create(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        let metadata = json!({ "container": serde_json::to_value(record)? });
        self.bucket
            .put(&Self::container_name(name), Bytes::new(), metadata)
            .await?;
        Ok(())
    }

    async fn container_update(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        let existing = self.bucket.find(&Self::container_name(name)).await?;
        if existing.is_empty() {
            return Err(StoreError::NotFound(Self::container_name(name)));
        }
        self.remove_all(&existing).await?;
        self.container_create(name, record).await
    }

    async fn container_fetch(&self, name: &str) -> StoreResult<ContainerRecord> {
        let container_name = Self::container_name(name);
        let chunk = self
            .bucket
            .find(&container_name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(container_name.clone()))?;

        let record = chunk
            .metadata
            .get("container")
            .cloned()
            .ok_or_else(|| StoreError::Backend(format!("{} has no container metadata", container_name)))?;
        Ok(serde_json::from_value(record)?)
    }

    async fn container_delete(&self, name: &str) -> StoreResult<()> {
        let existing = self.bucket.find(&Self::container_name(name)).await?;
        self.remove_all(&existing).await
    }
}
