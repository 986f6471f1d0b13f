//! MongoDB GridFS implementation of the chunk bucket

use async_trait::async_trait;
use bytes::Bytes;
use futures::{AsyncReadExt, AsyncWriteExt, TryStreamExt};
use mongodb::bson::{self, doc, oid::ObjectId, Bson, Document};
use mongodb::gridfs::{GridFsBucket as Bucket, GridFsDownloadStream, GridFsUploadStream};
use mongodb::options::{GridFsBucketOptions, GridFsFindOptions, GridFsUploadOptions};
use mongodb::Client;

use super::gridfs::{ChunkBucket, ChunkReader, ChunkWriter, StoredChunk, STREAM_BUFFER_SIZE};
use crate::error::{StoreError, StoreResult};

/// GridFS bucket holding upload chunks and container records
#[derive(Clone)]
pub struct GridFsBucket {
    bucket: Bucket,
}

impl GridFsBucket {
    pub async fn connect(url: &str, database: &str, bucket_name: &str) -> StoreResult<Self> {
        let client = Client::with_uri_str(url).await.map_err(backend)?;
        let options = GridFsBucketOptions::builder()
            .bucket_name(bucket_name.to_string())
            .build();
        let bucket = client.database(database).gridfs_bucket(options);

        tracing::info!("Using GridFS bucket {}.{}", database, bucket_name);
        Ok(Self { bucket })
    }
}

fn backend(err: mongodb::error::Error) -> StoreError {
    StoreError::Backend(format!("MongoDB error: {}", err))
}

fn object_id(id: &str) -> StoreResult<Bson> {
    ObjectId::parse_str(id)
        .map(Bson::ObjectId)
        .map_err(|_| StoreError::NotFound(id.to_string()))
}

fn id_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

fn metadata_document(metadata: &serde_json::Value) -> StoreResult<Document> {
    bson::to_document(metadata).map_err(|e| StoreError::Backend(format!("Invalid chunk metadata: {}", e)))
}

struct DownloadReader {
    stream: GridFsDownloadStream,
    buffer: Vec<u8>,
}

#[async_trait]
impl ChunkReader for DownloadReader {
    async fn next_slice(&mut self) -> StoreResult<Option<Bytes>> {
        let read = self.stream.read(&mut self.buffer).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buffer[..read])))
    }
}

struct UploadWriter {
    stream: GridFsUploadStream,
}

#[async_trait]
impl ChunkWriter for UploadWriter {
    async fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StoreResult<String> {
        self.stream.close().await?;
        Ok(id_string(self.stream.id()))
    }
}

#[async_trait]
impl ChunkBucket for GridFsBucket {
    async fn put(&self, filename: &str, data: Bytes, metadata: serde_json::Value) -> StoreResult<String> {
        let options = GridFsUploadOptions::builder()
            .metadata(metadata_document(&metadata)?)
            .build();

        let id = self
            .bucket
            .upload_from_futures_0_3_reader(filename, &data[..], options)
            .await
            .map_err(backend)?;
        Ok(id.to_hex())
    }

    async fn find(&self, filename: &str) -> StoreResult<Vec<StoredChunk>> {
        let options = GridFsFindOptions::builder()
            .sort(doc! { "metadata.sequence": 1 })
            .build();
        let files: Vec<_> = self
            .bucket
            .find(doc! { "filename": filename }, options)
            .await
            .map_err(backend)?
            .try_collect()
            .await
            .map_err(backend)?;

        files
            .into_iter()
            .map(|file| {
                let metadata = match file.metadata {
                    Some(document) => bson::from_document(document)
                        .map_err(|e| StoreError::Backend(format!("Invalid chunk metadata: {}", e)))?,
                    None => serde_json::Value::Null,
                };
                Ok(StoredChunk {
                    id: id_string(&file.id),
                    length: file.length,
                    metadata,
                })
            })
            .collect()
    }

    async fn open(&self, id: &str) -> StoreResult<Box<dyn ChunkReader>> {
        let stream = self
            .bucket
            .open_download_stream(object_id(id)?)
            .await
            .map_err(backend)?;

        Ok(Box::new(DownloadReader {
            stream,
            buffer: vec![0; STREAM_BUFFER_SIZE],
        }))
    }

    async fn create(&self, filename: &str, metadata: serde_json::Value) -> StoreResult<Box<dyn ChunkWriter>> {
        let options = GridFsUploadOptions::builder()
            .metadata(metadata_document(&metadata)?)
            .build();
        let stream = self.bucket.open_upload_stream(filename, options);
        Ok(Box::new(UploadWriter { stream }))
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        self.bucket.delete(object_id(id)?).await.map_err(backend)
    }
}
