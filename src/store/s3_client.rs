//! S3-compatible storage client
//!
//! Wraps the AWS SDK for the multipart operations the upload store needs.
//! Works against MinIO, Cloudflare R2, Backblaze B2 and AWS S3.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::ProvideErrorMetadata,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, MetadataDirective},
    Client,
};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use super::s3::{ObjectClient, PartSummary};
use super::UploadedPart;
use crate::config::S3Config;
use crate::error::{StoreError, StoreResult};

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &S3Config) -> StoreResult<Self> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "tus-server",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        // Test connection by checking if bucket exists
        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!("Connected to S3 bucket: {}", bucket);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    bucket,
                    e
                );
            }
        }

        Ok(Self { client, bucket })
    }

}

/// Map an SDK error, turning the given service error codes into `NotFound`
fn sdk_error<E>(context: &str, key: &str, err: E, not_found: &[&str]) -> StoreError
where
    E: ProvideErrorMetadata + std::fmt::Display,
{
    match err.code() {
        Some(code) if not_found.contains(&code) => StoreError::NotFound(key.to_string()),
        Some("PreconditionFailed") => StoreError::AlreadyExists(key.to_string()),
        _ => StoreError::Backend(format!("Failed to {} {}: {}", context, key, err)),
    }
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn create_multipart_upload(&self, key: &str) -> StoreResult<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("create multipart upload for", key, e, &[]))?;

        response
            .upload_id()
            .map(|id| id.to_string())
            .ok_or_else(|| StoreError::Backend(format!("No upload id returned for {}", key)))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StoreResult<String> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| sdk_error("upload part of", key, e, &["NoSuchUpload"]))?;

        response
            .e_tag()
            .map(|tag| tag.to_string())
            .ok_or_else(|| StoreError::Backend(format!("No ETag returned for part {} of {}", part_number, key)))
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> StoreResult<Vec<PartSummary>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let response = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(|e| sdk_error("list parts of", key, e, &["NoSuchUpload"]))?;

            parts.extend(response.parts().iter().map(|part| PartSummary {
                part_number: part.part_number().unwrap_or(0),
                size: part.size().unwrap_or(0).max(0) as u64,
            }));

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            match response.next_part_number_marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        Ok(parts)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> StoreResult<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(&part.e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| sdk_error("complete multipart upload for", key, e, &["NoSuchUpload"]))?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("abort multipart upload for", key, e, &["NoSuchUpload"]))?;

        Ok(())
    }

    async fn set_content_type(&self, key: &str, content_type: &str) -> StoreResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(format!("{}/{}", self.bucket, urlencoding::encode(key)))
            .metadata_directive(MetadataDirective::Replace)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| sdk_error("set content type of", key, e, &["NoSuchKey"]))?;

        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        exclusive: bool,
    ) -> StoreResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data));

        if exclusive {
            request = request.if_none_match("*");
        }

        request
            .send()
            .await
            .map_err(|e| sdk_error("put object", key, e, &[]))?;

        Ok(())
    }

    async fn get_object(&self, key: &str) -> StoreResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("get object", key, e, &["NoSuchKey", "NotFound"]))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to read object body {}: {}", key, e)))?
            .into_bytes();

        Ok(data)
    }

    async fn download_object(&self, key: &str, target: &Path) -> StoreResult<()> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("download object", key, e, &["NoSuchKey", "NotFound"]))?;

        let mut body = response.body.into_async_read();
        let mut file = tokio::fs::File::create(target).await?;
        let written = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;

        tracing::debug!(key = %key, bytes = written, "Downloaded object");
        Ok(())
    }

    async fn head_object(&self, key: &str) -> StoreResult<Option<u64>> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => Ok(Some(response.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) => Ok(None),
            Err(e) => Err(sdk_error("head object", key, e, &["NotFound", "NoSuchKey"])),
        }
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("delete object", key, e, &["NoSuchKey"]))?;

        Ok(())
    }
}
