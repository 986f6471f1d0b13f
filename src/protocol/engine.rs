//! TUS protocol engine
//!
//! Transport-agnostic request handling: a [`TusRequest`] goes in, a
//! [`TusResponse`] comes out. Each upload moves through
//! `NEW -> OPEN -> COMPLETE` or ends in `DELETED`; the container record
//! exists exactly while the upload is OPEN.
//!
//! Supported extensions:
//! - creation, checksum, termination (TUS 1.0.0)
//! - Express: HEAD or PATCH at offset 0 create the upload implicitly
//! - CrossCheck: a whole-file checksum captured at creation and verified
//!   once the last byte arrives

use std::sync::Arc;

use axum::http::header::{IntoHeaderName, CACHE_CONTROL, LOCATION};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use uuid::Uuid;

use super::checksum::{ChecksumAlgorithm, ChecksumSpec};
use super::headers::*;
use crate::config::TusConfig;
use crate::error::{Result, StoreError, TusError};
use crate::store::{ContainerRecord, UploadStore};

/// Algorithms accepted for per-chunk checksums (computed by the engine)
const CHUNK_ALGORITHMS: &[ChecksumAlgorithm] = &ChecksumAlgorithm::ALL;

/// A protocol request, detached from the HTTP framework
#[derive(Debug, Clone)]
pub struct TusRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A protocol response; TUS responses never carry a body
#[derive(Debug)]
pub struct TusResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl TusResponse {
    fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    fn with_header<K: IntoHeaderName>(mut self, name: K, value: impl ToString) -> Self {
        match HeaderValue::from_str(&value.to_string()) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(e) => tracing::warn!("Dropping invalid response header value: {}", e),
        }
        self
    }

    /// Header value as a string, if present
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl IntoResponse for TusResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers).into_response()
    }
}

/// Verbs the protocol understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TusMethod {
    Post,
    Head,
    Patch,
    Delete,
    Options,
}

impl TusMethod {
    fn from_method(method: &Method) -> Option<Self> {
        match method.as_str() {
            "POST" => Some(Self::Post),
            "HEAD" => Some(Self::Head),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }
}

/// Protocol engine bound to one storage backend
#[derive(Clone)]
pub struct TusServer {
    store: Arc<dyn UploadStore>,
    config: TusConfig,
}

impl TusServer {
    pub fn new(store: Arc<dyn UploadStore>, config: TusConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &TusConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn UploadStore> {
        &self.store
    }

    /// Handle one request
    ///
    /// Never fails: protocol errors become responses with the matching
    /// status code. Every response carries the common TUS headers.
    pub async fn handle(&self, request: TusRequest) -> TusResponse {
        let method = request.method.clone();
        let path = request.uri.path().to_string();

        let mut response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    TusError::Storage(StoreError::NotFound(_)) => {
                        tracing::debug!(method = %method, path = %path, "{}", e)
                    }
                    TusError::Storage(_) => {
                        tracing::error!(method = %method, path = %path, "{}", e)
                    }
                    _ => tracing::debug!(method = %method, path = %path, "Rejected: {}", e),
                }
                error_response(&e)
            }
        };

        response = response
            .with_header(TUS_RESUMABLE, TUS_VERSION)
            .with_header(TUS_MAX_SIZE, self.config.max_size)
            .with_header(CACHE_CONTROL, "no-store");
        response
    }

    async fn dispatch(&self, request: TusRequest) -> Result<TusResponse> {
        let method = TusMethod::from_method(&request.method)
            .ok_or_else(|| TusError::MethodNotAllowed(request.method.clone()))?;

        match header_str(&request.headers, TUS_RESUMABLE) {
            Some(TUS_VERSION) => {}
            other => return Err(TusError::VersionMismatch(other.map(str::to_string))),
        }

        match method {
            TusMethod::Options => Ok(self.capabilities()),
            TusMethod::Post => {
                let mut name = self.resolve(&request.uri)?;
                if name.is_empty() {
                    name = Uuid::new_v4().to_string();
                }
                self.create_upload(&name, &request.headers).await?;
                Ok(TusResponse::new(StatusCode::CREATED).with_header(LOCATION, self.location(&name)))
            }
            TusMethod::Head => {
                let name = self.target(&request.uri)?;
                let offset = self.upload_offset(&name, &request.headers).await?;

                let mut response = TusResponse::new(StatusCode::OK).with_header(UPLOAD_OFFSET, offset);
                if flag(&request.headers, EXPRESS) {
                    response = response.with_header(LOCATION, self.location(&name));
                }
                Ok(response)
            }
            TusMethod::Patch => {
                let name = self.target(&request.uri)?;
                let offset = self
                    .append_chunk(&name, &request.headers, request.body)
                    .await?;

                let mut response = TusResponse::new(StatusCode::NO_CONTENT).with_header(UPLOAD_OFFSET, offset);
                if flag(&request.headers, CROSS_CHECK) {
                    response = response.with_header(LOCATION, self.location(&name));
                }
                Ok(response)
            }
            TusMethod::Delete => {
                let name = self.target(&request.uri)?;
                self.remove_upload(&name).await?;
                Ok(TusResponse::new(StatusCode::NO_CONTENT))
            }
        }
    }

    /// Upload name addressed by `uri`, refusing the backend's container namespace
    fn resolve(&self, uri: &Uri) -> Result<String> {
        let name = resolve_name(uri.path(), &self.config.api_path)?;
        if self.store.is_reserved(&name) {
            tracing::warn!(name = %name, "Refused reserved upload name");
            return Err(TusError::Malformed(format!("Reserved upload name: {}", name)));
        }
        Ok(name)
    }

    /// Name of an existing upload addressed by `uri`
    fn target(&self, uri: &Uri) -> Result<String> {
        let name = self.resolve(uri)?;
        if name.is_empty() {
            return Err(TusError::NotFound(uri.path().to_string()));
        }
        Ok(name)
    }

    fn location(&self, name: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_path.trim_end_matches('/'),
            urlencoding::encode(name)
        )
    }

    /// Create an empty upload (POST)
    pub async fn create_upload(&self, name: &str, headers: &HeaderMap) -> Result<()> {
        if self.store.exists(name).await? {
            return Err(TusError::AlreadyExists(name.to_string()));
        }

        let length = parse_u64(headers, UPLOAD_LENGTH)?;
        if self.config.max_size > 0 && length > self.config.max_size {
            return Err(TusError::TooLarge {
                length,
                max: self.config.max_size,
            });
        }

        let checksum = if flag(headers, CROSS_CHECK) {
            let spec = parse_checksum(headers, UPLOAD_CROSS_CHECKSUM)?;
            if !self.store.cross_check_algorithms().contains(&spec.algorithm) {
                return Err(TusError::Malformed(format!(
                    "{} backend cannot verify whole files with {}",
                    self.store.kind().as_str(),
                    spec.algorithm
                )));
            }
            Some(spec)
        } else {
            None
        };

        let cross_check = checksum.is_some();
        match self.store.create(name, ContainerRecord::new(length, checksum)).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => return Err(TusError::AlreadyExists(name.to_string())),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(name = %name, length = length, cross_check = cross_check, "Upload created");
        Ok(())
    }

    /// Current offset of an upload (HEAD)
    ///
    /// With Express the upload is created first when it does not exist yet.
    pub async fn upload_offset(&self, name: &str, headers: &HeaderMap) -> Result<u64> {
        if flag(headers, EXPRESS) {
            match self.create_upload(name, headers).await {
                Ok(()) | Err(TusError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        } else if !self.store.exists(name).await? {
            return Err(TusError::NotFound(name.to_string()));
        }

        Ok(self.store.size(name).await?)
    }

    /// Append one chunk (PATCH), returning the new offset
    ///
    /// Nothing is written unless the offset matches the stored size and
    /// the chunk checksum verifies.
    pub async fn append_chunk(&self, name: &str, headers: &HeaderMap, body: Bytes) -> Result<u64> {
        let offset = parse_u64(headers, UPLOAD_OFFSET)?;
        let checksum = parse_checksum(headers, UPLOAD_CHECKSUM)?;
        if !CHUNK_ALGORITHMS.contains(&checksum.algorithm) {
            return Err(TusError::Malformed(format!(
                "Unsupported chunk checksum algorithm: {}",
                checksum.algorithm
            )));
        }

        if flag(headers, EXPRESS) && offset == 0 {
            match self.create_upload(name, headers).await {
                Ok(()) => {}
                Err(TusError::AlreadyExists(existing)) => {
                    // Only an upload that is still open may be resumed this way
                    if !self.store.container_exists(name).await? {
                        tracing::warn!(name = %name, "Express create on a finished upload refused");
                        return Err(TusError::AlreadyExists(existing));
                    }
                }
                Err(e) => return Err(e),
            }
        } else if !self.store.exists(name).await? {
            return Err(TusError::NotFound(name.to_string()));
        }

        let stored = self.store.size(name).await?;
        if stored != offset {
            return Err(TusError::OffsetMismatch {
                stored,
                requested: offset,
            });
        }

        if !checksum.matches(&body) {
            tracing::warn!(name = %name, offset = offset, algorithm = %checksum.algorithm, "Chunk checksum mismatch");
            return Err(TusError::ChecksumMismatch { stored });
        }

        let record = match self.store.container_fetch(name).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Err(TusError::UploadFinished { stored }),
            Err(e) => return Err(e.into()),
        };

        let chunk_len = body.len();
        self.store.append(name, body).await?;
        let size = self.store.size(name).await?;
        tracing::debug!(name = %name, offset = offset, chunk = chunk_len, size = size, "Chunk appended");

        if record.is_complete(size) {
            self.finish(name, flag(headers, CROSS_CHECK)).await?;
        }
        Ok(size)
    }

    /// Close an upload whose last byte has arrived
    async fn finish(&self, name: &str, cross_check: bool) -> Result<()> {
        // The latest record carries the backend's continuation state
        let record = self.store.container_fetch(name).await?;
        self.store.container_delete(name).await?;
        self.store.complete(name, &record).await?;
        tracing::info!(name = %name, length = record.length, "Upload complete");

        if !cross_check {
            return Ok(());
        }
        let Some(expected) = &record.checksum else {
            tracing::warn!(name = %name, "CrossCheck requested but no whole-file checksum was recorded");
            return Ok(());
        };

        if self.store.cross_check(name, expected).await? {
            tracing::debug!(name = %name, algorithm = %expected.algorithm, "CrossCheck passed");
            return Ok(());
        }

        tracing::warn!(name = %name, algorithm = %expected.algorithm, "CrossCheck failed, discarding upload");
        if let Err(e) = self.store.delete(name).await {
            tracing::error!(name = %name, error = %e, "Failed to delete upload after CrossCheck failure");
        }
        Err(TusError::CrossCheckFailed(name.to_string()))
    }

    /// Terminate an upload (DELETE)
    pub async fn remove_upload(&self, name: &str) -> Result<()> {
        if !self.store.exists(name).await? {
            return Err(TusError::NotFound(name.to_string()));
        }

        self.store.delete(name).await?;
        self.store.container_delete(name).await?;
        tracing::info!(name = %name, "Upload removed");
        Ok(())
    }

    /// Server capabilities (OPTIONS)
    pub fn capabilities(&self) -> TusResponse {
        TusResponse::new(StatusCode::NO_CONTENT)
            .with_header(TUS_VERSION_HEADER, TUS_VERSION)
            .with_header(TUS_EXTENSION, TUS_EXTENSIONS)
            .with_header(TUS_CHECKSUM_ALGORITHM, ChecksumAlgorithm::header_list(CHUNK_ALGORITHMS))
    }
}

fn parse_checksum(headers: &HeaderMap, name: &str) -> Result<ChecksumSpec> {
    ChecksumSpec::parse(header_str(headers, name).unwrap_or_default())
        .map_err(|e| TusError::Malformed(format!("Invalid {} header: {}", name, e)))
}

fn error_response(error: &TusError) -> TusResponse {
    let response = TusResponse::new(error.status_code());
    match error.offset() {
        Some(offset) => response.with_header(UPLOAD_OFFSET, offset),
        None => response,
    }
}
