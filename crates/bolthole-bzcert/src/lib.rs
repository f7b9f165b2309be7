//! Bolthole BZCert - workstation certificate verification
//!
//! A certificate is accepted when:
//! - its auth nonce (SHA3 over pubkey, rand signature and rand) matches the
//!   `nonce` claim of the initial id token,
//! - `signature_on_rand` verifies under the certificate's public key,
//! - the initial id token verifies against the configured IdP and was
//!   issued less than five years ago,
//! - the current id token verifies against the same IdP and has not
//!   expired.
//!
//! Service-account certificates (detected by a `jku` header on the id
//! token) are instead verified against a JWKS fetched from the `jku` URL,
//! which must match the configured allow-list of URL patterns.

mod idp;
mod service_account;
mod verifier;

pub use idp::IdpProvider;
pub use service_account::jku_pattern;
pub use verifier::{BzCertVerifier, VerifierConfig};

use thiserror::Error;

/// Inner failure detail for a token verification step
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token rejected: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("token expired at {0}")]
    Expired(i64),

    #[error("initial token issued too long ago (iat {iat})")]
    InitialWindowExceeded { iat: i64 },

    #[error("missing claim {0:?}")]
    MissingClaim(&'static str),

    #[error("claim {claim:?} mismatch: expected {expected:?}, got {actual:?}")]
    ClaimMismatch {
        claim: &'static str,
        expected: String,
        actual: String,
    },

    #[error("nonce claim does not match certificate")]
    NonceMismatch,

    #[error("no JWKS key with kid {0:?}")]
    KeyNotFound(String),

    #[error("identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("jku {0:?} is not in the allowed pattern list")]
    JkuNotAllowed(String),

    #[error("invalid jku {url:?}: {reason}")]
    InvalidJku { url: String, reason: String },

    #[error("rand signature invalid: {0}")]
    RandSignature(#[from] bolthole_crypto::CryptoError),
}

/// Certificate rejection, distinguishable by verification stage
#[derive(Debug, Error)]
pub enum BzCertError {
    #[error("initial id token verification failed: {0}")]
    InitialIdToken(#[source] TokenError),

    #[error("current id token verification failed: {0}")]
    CurrentIdToken(#[source] TokenError),

    #[error("service account verification failed: {0}")]
    ServiceAccount(#[source] TokenError),

    #[error("certificate configuration error: {0}")]
    CertConfig(String),
}

pub type BzCertResult<T> = Result<T, BzCertError>;
