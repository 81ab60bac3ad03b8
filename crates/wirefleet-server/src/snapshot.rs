//! Status documents and their content digest

use sha2::{Digest, Sha256};
use wirefleet_core::{FleetError, Result, Status};

/// A serialized status document together with its ETag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub status: Status,
    pub body: String,
    pub etag: String,
}

/// Lowercase hex SHA-256 of a document body
pub fn digest(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

/// Serialize a status and compute its ETag.
///
/// `last_seen` is removed first so poll telemetry never changes the digest.
pub fn seal(mut status: Status) -> Result<Snapshot> {
    status.device.last_seen = None;

    let body = serde_json::to_string(&status).map_err(|e| FleetError::Internal(e.to_string()))?;
    let etag = digest(body.as_bytes());

    Ok(Snapshot { status, body, etag })
}

/// Compare an `If-None-Match` header value with a bare ETag.
///
/// Accepts quoted and weak forms, comma-separated lists and `*`.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match.split(',').map(str::trim).any(|candidate| {
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        let candidate = candidate.trim_matches('"');
        candidate == "*" || candidate == etag
    })
}
