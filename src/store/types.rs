//! Storage types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::ChecksumSpec;

/// Sidecar metadata kept while an upload is open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Declared total length, fixed at creation
    pub length: u64,

    /// Whole-file checksum captured at creation (CrossCheck)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumSpec>,

    pub created_at: DateTime<Utc>,

    /// Backend continuation state
    #[serde(default)]
    pub continuation: Continuation,
}

impl ContainerRecord {
    pub fn new(length: u64, checksum: Option<ChecksumSpec>) -> Self {
        Self {
            length,
            checksum,
            created_at: Utc::now(),
            continuation: Continuation::None,
        }
    }

    /// Whether `size` bytes satisfy the declared length
    pub fn is_complete(&self, size: u64) -> bool {
        size >= self.length
    }
}

/// Backend-specific state needed to continue an upload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Continuation {
    #[default]
    None,

    /// Object store multipart session
    Multipart {
        upload_id: String,
        #[serde(default)]
        parts: Vec<UploadedPart>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },

    /// Document store chunk bookkeeping
    Chunked { chunks: u64 },
}

/// A part accepted by the object store, in submission order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// Identifies the backend behind an `UploadStore`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Filesystem,
    ObjectStore,
    DocumentStore,
    KeyValue,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::ObjectStore => "s3",
            Self::DocumentStore => "gridfs",
            Self::KeyValue => "keyvalue",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChecksumAlgorithm;

    #[test]
    fn test_container_json_shape() {
        let mut record = ContainerRecord::new(
            10,
            Some(ChecksumSpec::new(ChecksumAlgorithm::Md5, "qSVXaULpSy71egZhAbSIdg==")),
        );
        record.continuation = Continuation::Multipart {
            upload_id: "abc".to_string(),
            parts: vec![UploadedPart { part_number: 1, e_tag: "\"e1\"".to_string() }],
            content_type: Some("image/png".to_string()),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["length"], 10);
        assert_eq!(json["checksum"]["algorithm"], "md5");
        assert_eq!(json["continuation"]["kind"], "multipart");
        assert_eq!(json["continuation"]["parts"][0]["part_number"], 1);

        let back: ContainerRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_minimal_container_defaults() {
        let record: ContainerRecord =
            serde_json::from_str(r#"{"length":4,"created_at":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(record.checksum, None);
        assert_eq!(record.continuation, Continuation::None);
        assert!(!record.is_complete(3));
        assert!(record.is_complete(4));
    }
}
