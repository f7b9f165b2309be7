//! Bolthole Bastion - the agent's REST surface to the broker
//!
//! Everything the agent says to the bastion outside a connection lives
//! here: the one-shot registration bootstrap, the cached agent-identity
//! bearer token, and the asynchronous restart/error reports.

pub mod api;
pub mod registration;
pub mod token;

pub use api::{
    BastionClient, ErrorReport, RegistrationRequest, RegistrationResponse, ReportReporter,
    RestartReport,
};
pub use registration::{register, RegistrationOptions};
pub use token::IdentityTokenCache;

use thiserror::Error;

use bolthole_config::ConfigError;
use bolthole_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum BastionError {
    #[error("bastion request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bastion rejected the request ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("could not persist registration after repeated conflicts")]
    PersistRetriesExhausted,
}

pub type BastionResult<T> = Result<T, BastionError>;
