//! Header names, protocol constants and request helpers

use axum::http::HeaderMap;

use crate::error::TusError;

pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised on OPTIONS
pub const TUS_EXTENSIONS: &str = "creation,checksum,termination,crosscheck,express";

pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const TUS_VERSION_HEADER: &str = "tus-version";
pub const TUS_MAX_SIZE: &str = "tus-max-size";
pub const TUS_EXTENSION: &str = "tus-extension";
pub const TUS_CHECKSUM_ALGORITHM: &str = "tus-checksum-algorithm";
pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_CHECKSUM: &str = "upload-checksum";
pub const UPLOAD_CROSS_CHECKSUM: &str = "upload-crosschecksum";
pub const EXPRESS: &str = "express";
pub const CROSS_CHECK: &str = "crosscheck";

/// Header value as a trimmed string, if present and valid UTF-8
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// Whether an extension flag header is switched on
///
/// Any non-empty value other than `0` or `false` counts.
pub fn flag(headers: &HeaderMap, name: &str) -> bool {
    match header_str(headers, name) {
        Some(value) => !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false"),
        None => false,
    }
}

/// Parse a non-negative integer header, mapping failures to 400
pub fn parse_u64(headers: &HeaderMap, name: &str) -> Result<u64, TusError> {
    let raw = header_str(headers, name)
        .ok_or_else(|| TusError::Malformed(format!("Missing {} header", name)))?;
    raw.parse()
        .map_err(|_| TusError::Malformed(format!("Invalid {} header: {}", name, raw)))
}

/// Resolve the upload name from a request path
///
/// Takes the tail after `api_path`, percent-decodes it and strips every
/// path separator. Returns an empty string for the collection itself and
/// rejects paths that are not below `api_path`.
pub fn resolve_name(path: &str, api_path: &str) -> Result<String, TusError> {
    let base = api_path.trim_end_matches('/');
    let tail = match path.strip_prefix(base) {
        Some("") => "",
        Some(rest) => rest
            .strip_prefix('/')
            .ok_or_else(|| TusError::Malformed(format!("Path outside {}: {}", api_path, path)))?,
        None => return Err(TusError::Malformed(format!("Path outside {}: {}", api_path, path))),
    };

    let decoded = urlencoding::decode(tail)
        .map_err(|_| TusError::Malformed(format!("Invalid upload name: {}", tail)))?;
    let name: String = decoded.chars().filter(|c| *c != '/' && *c != '\\').collect();

    if name == "." || name == ".." {
        return Err(TusError::Malformed(format!("Invalid upload name: {}", name)));
    }
    Ok(name)
}
