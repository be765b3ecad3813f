//! Content fingerprints (ETags).
//!
//! Values are serialized through `serde_json::Value` before hashing. Its
//! object map orders keys lexicographically (the `preserve_order` feature of
//! `serde_json` must stay disabled), so two structurally equal values hash
//! identically no matter how their fields were populated.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fingerprint any serializable value.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(value)?;
    Ok(fingerprint_value(&canonical))
}

/// Fingerprint a JSON value: quoted, lowercase hex SHA-256 of its canonical
/// serialization.
pub fn fingerprint_value(value: &Value) -> String {
    let mut hasher = Sha256::new();
    // Writing a `Value` into a Vec cannot fail.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hasher.update(&bytes);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Evaluate an `If-None-Match` header value against a strong ETag.
///
/// Returns true when the client's copy is current and a `304` may be sent.
/// Weak validators compare by opaque tag, as GET conditional requests allow.
pub fn if_none_match(header: &str, etag: &str) -> bool {
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == etag
    })
}
