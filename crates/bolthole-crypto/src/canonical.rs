//! Deterministic JSON canonicalisation and hashing
//!
//! Signature verification depends on byte-exact reproduction of the signed
//! bytes on both sides of a connection, so the canonical form is fixed:
//! object keys sorted alphabetically, no HTML escaping, and U+000C emitted
//! as the two-character escape `\f`. Serialising through
//! [`serde_json::Value`] gives exactly that: the default `Map` is ordered
//! by key, and `serde_json` neither HTML-escapes nor widens `\f` to a
//! `\u` escape.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use sha3::{Digest, Sha3_256};

use crate::CryptoResult;

/// Serialise a value to its canonical JSON bytes
pub fn canonical_json<T: Serialize>(value: &T) -> CryptoResult<Vec<u8>> {
    let normalised = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&normalised)?)
}

/// SHA3-256 digest of raw bytes
pub fn sha3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA3-256 digest of raw bytes, base64-encoded
pub fn sha3_base64(data: &[u8]) -> String {
    BASE64.encode(sha3_digest(data))
}

/// The canonical hash of a value: base64(SHA3-256(canonical JSON))
pub fn canonical_hash<T: Serialize>(value: &T) -> CryptoResult<String> {
    Ok(sha3_base64(&canonical_json(value)?))
}

/// The raw digest of a value's canonical JSON, for signing
pub fn canonical_digest<T: Serialize>(value: &T) -> CryptoResult<[u8; 32]> {
    Ok(sha3_digest(&canonical_json(value)?))
}
