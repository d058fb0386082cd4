//! Status helpers: content hashes and timestamps

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::controller::error::Result;

/// SHA-256 (hex) over the canonical JSON encoding of `value`
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Check if the content changed since the hash recorded in status
pub fn hash_changed(applied: Option<&str>, current: &str) -> bool {
    match applied {
        Some(applied) if !applied.is_empty() => applied != current,
        _ => true, // Never applied
    }
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339()
}

/// Parse an RFC 3339 status timestamp
pub fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}
