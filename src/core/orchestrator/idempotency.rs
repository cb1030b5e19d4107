use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::error::Result;

/// Stable hash of a request body. Struct fields serialize in declaration
/// order and maps are sorted, so equal requests hash equally.
pub fn fingerprint<T: Serialize>(request: &T) -> Result<String> {
    let canonical = serde_json::to_vec(&serde_json::to_value(request)?)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Missing and blank keys both mean "no idempotency".
pub fn normalize_key(key: Option<&str>) -> Option<String> {
    key.map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}
