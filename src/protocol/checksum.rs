//! Checksum algorithms
//!
//! Digest computation for the checksum (per chunk) and CrossCheck (whole
//! file) extensions. Values travel as `"<algorithm> <base64 digest>"`.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Digest algorithms understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Crc32,
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Every supported algorithm, in advertisement order
    pub const ALL: [ChecksumAlgorithm; 5] = [
        ChecksumAlgorithm::Crc32,
        ChecksumAlgorithm::Md5,
        ChecksumAlgorithm::Sha1,
        ChecksumAlgorithm::Sha256,
        ChecksumAlgorithm::Sha512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crc32 => "crc32",
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Start an incremental digest
    pub fn hasher(&self) -> ChecksumHasher {
        match self {
            Self::Crc32 => ChecksumHasher::Crc32(crc32fast::Hasher::new()),
            Self::Md5 => ChecksumHasher::Md5(md5::Md5::new()),
            Self::Sha1 => ChecksumHasher::Sha1(Sha1::new()),
            Self::Sha256 => ChecksumHasher::Sha256(Sha256::new()),
            Self::Sha512 => ChecksumHasher::Sha512(Sha512::new()),
        }
    }

    /// Base64 digest of a complete buffer
    pub fn digest(&self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Comma separated list for the `Tus-Checksum-Algorithm` header
    pub fn header_list(algorithms: &[ChecksumAlgorithm]) -> String {
        algorithms
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ChecksumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crc32" => Ok(Self::Crc32),
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(ChecksumParseError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Incremental digest state
pub enum ChecksumHasher {
    Crc32(crc32fast::Hasher),
    Md5(md5::Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl ChecksumHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Crc32(h) => h.update(data),
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Finish and return the base64 encoded raw digest
    ///
    /// CRC-32 is encoded as its four big-endian bytes.
    pub fn finalize(self) -> String {
        let raw = match self {
            Self::Crc32(h) => h.finalize().to_be_bytes().to_vec(),
            Self::Md5(h) => h.finalize().to_vec(),
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        };
        STANDARD.encode(raw)
    }
}

/// Algorithm plus expected base64 digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl ChecksumSpec {
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into(),
        }
    }

    /// Parse a `"<algorithm> <value>"` header value
    pub fn parse(header: &str) -> Result<Self, ChecksumParseError> {
        let header = header.trim();
        if header.is_empty() {
            return Err(ChecksumParseError::Missing);
        }

        let mut parts = header.splitn(2, ' ');
        let algorithm = parts.next().unwrap_or_default().parse()?;
        let value = parts
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ChecksumParseError::MissingValue)?;

        Ok(Self::new(algorithm, value))
    }

    /// Check a complete buffer against the expected digest
    pub fn matches(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == self.value
    }
}

impl fmt::Display for ChecksumSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChecksumParseError {
    #[error("checksum header is missing")]
    Missing,

    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("checksum value is missing")]
    MissingValue,
}
