//! Bolthole Crypto - cryptographic primitives for the data plane
//!
//! This crate provides:
//! - Ed25519 key pair generation and management
//! - Signing and verification over canonical SHA3-256 hashes
//! - Deterministic JSON canonicalisation
//!
//! # Security Invariant
//!
//! **Private keys never leave the process that generated them.** They are
//! persisted only through the config store and are exported solely in the
//! base64 form used there.

pub mod canonical;
pub mod keys;

pub use canonical::*;
pub use keys::*;

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("signature verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("canonicalisation failed: {0}")]
    Canonicalisation(#[from] serde_json::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
