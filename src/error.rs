//! Error types for the TUS server

use axum::http::{Method, StatusCode};
use thiserror::Error;

/// Result type for storage backends
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, TusError>;

/// Non-standard status used for chunk checksum mismatches
pub const CHECKSUM_MISMATCH: u16 = 460;

/// Protocol-level error, one variant per response class
#[derive(Error, Debug)]
pub enum TusError {
    #[error("Unsupported protocol version: {0:?}")]
    VersionMismatch(Option<String>),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(Method),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Upload already exists: {0}")]
    AlreadyExists(String),

    #[error("Offset mismatch: stored {stored}, requested {requested}")]
    OffsetMismatch { stored: u64, requested: u64 },

    #[error("Upload already finished at offset {stored}")]
    UploadFinished { stored: u64 },

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload too large: {length} bytes (max: {max})")]
    TooLarge { length: u64, max: u64 },

    #[error("Chunk checksum mismatch at offset {stored}")]
    ChecksumMismatch { stored: u64 },

    #[error("Whole-file checksum mismatch: {0}")]
    CrossCheckFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl TusError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::VersionMismatch(_) => StatusCode::PRECONDITION_FAILED,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::UploadFinished { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ChecksumMismatch { .. } => {
                StatusCode::from_u16(CHECKSUM_MISMATCH).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::CrossCheckFailed(_) => StatusCode::GONE,
            Self::Storage(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stored size to report back so the client can resynchronize
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::OffsetMismatch { stored, .. }
            | Self::UploadFinished { stored }
            | Self::ChecksumMismatch { stored } => Some(*stored),
            _ => None,
        }
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Operation not supported by the {0} backend")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Container serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}
