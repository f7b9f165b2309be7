//! Bolthole Types - the shared wire vocabulary
//!
//! This crate defines:
//! - The CCH (Cryptographic Chained Handshake) message model
//! - The transport envelope and its message types
//! - Schema version parsing and ordering
//! - The workstation certificate data model

pub mod cert;
pub mod message;
pub mod schema;
pub mod wire;

pub use cert::*;
pub use message::*;
pub use schema::*;
pub use wire::*;

/// Serde adapter encoding opaque byte payloads as base64 strings on the wire
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
