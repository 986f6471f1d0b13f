//! TUS 1.0.0 protocol handling

pub mod checksum;
pub mod engine;
pub mod headers;

pub use checksum::{ChecksumAlgorithm, ChecksumHasher, ChecksumParseError, ChecksumSpec};
pub use engine::{TusRequest, TusResponse, TusServer};
pub use headers::{TUS_EXTENSIONS, TUS_VERSION};
