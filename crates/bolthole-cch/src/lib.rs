//! Bolthole CCH - the Cryptographic Chained Handshake
//!
//! Each datachannel owns one CCH session: a Syn/SynAck handshake followed
//! by Data/DataAck pairs whose hash chain orders every message and binds
//! it to the daemon's workstation certificate. This crate implements both
//! ends:
//!
//! - [`AgentCch`]: validates inbound messages and emits signed acks.
//! - [`DaemonCch`]: builds pipelined Data messages under a bounded
//!   in-flight window and re-synchronises the chain after peer errors.

pub mod agent;
pub mod daemon;
pub mod testing;

pub use agent::AgentCch;
pub use daemon::{DaemonCch, DaemonCchConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use bolthole_bzcert::{BzCertError, BzCertVerifier};
use bolthole_crypto::CryptoError;
use bolthole_types::{BzCert, ParseVersionError};

/// Protocol version spoken by current builds
pub const CCH_SCHEMA_VERSION: &str = "2.1";

/// Default bound on unacked Data messages in flight
pub const DEFAULT_PIPELINE_LIMIT: usize = 8;

/// Recovery attempts tolerated before a session is declared lost
pub const MAX_ERROR_RECOVERY_TRIES: u32 = 3;

/// Protocol errors raised by either engine
#[derive(Debug, Error)]
pub enum CchError {
    #[error("unknown hpointer {0:?}")]
    UnknownHPointer(String),

    #[error("invalid signature on {0} message")]
    InvalidSignature(&'static str),

    #[error(transparent)]
    FailedToParseVersion(#[from] ParseVersionError),

    #[error("failed to sign outbound message: {0}")]
    FailedToSign(#[source] CryptoError),

    #[error("hash chain mismatch: expected {expected:?}, received {received:?}")]
    ChainMismatch { expected: String, received: String },

    #[error("message targeted at {received:?}, but this endpoint is {expected:?}")]
    TargetMismatch { expected: String, received: String },

    #[error("data message bound to a certificate other than the session's")]
    CertHashMismatch,

    #[error("client certificate expired at {0}")]
    CertExpired(DateTime<Utc>),

    #[error(transparent)]
    Cert(#[from] BzCertError),

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("error recovery failed after {0} attempts")]
    RecoveryExhausted(u32),

    #[error("engine shut down")]
    Shutdown,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type CchResult<T> = Result<T, CchError>;

/// Certificate validation seam on the agent side
#[async_trait]
pub trait CertVerify: Send + Sync {
    /// Returns the expiry of the certificate's current id token
    async fn verify(&self, cert: &BzCert) -> Result<DateTime<Utc>, BzCertError>;
}

#[async_trait]
impl CertVerify for BzCertVerifier {
    async fn verify(&self, cert: &BzCert) -> Result<DateTime<Utc>, BzCertError> {
        BzCertVerifier::verify(self, cert).await
    }
}

/// Certificate refresh seam on the daemon side; the daemon re-reads its
/// workstation config before every Syn so token refreshes are picked up.
#[async_trait]
pub trait CertProvider: Send + Sync {
    async fn refresh(&self) -> Result<BzCert, BzCertError>;
}
