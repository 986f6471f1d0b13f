//! TUS Server Library
//!
//! Resumable uploads over HTTP following TUS 1.0.0 with the creation,
//! checksum and termination extensions, plus two extras: Express (implicit
//! creation) and CrossCheck (whole-file verification on completion).
//!
//! Uploads are stored through a pluggable [`store::UploadStore`] backend:
//! local filesystem, S3 multipart, GridFS-style chunked documents, or an
//! expiring key/value blob.

pub mod config;
pub mod error;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod store;
