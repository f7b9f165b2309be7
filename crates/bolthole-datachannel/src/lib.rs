//! Bolthole Datachannel - one CCH session over the shared transport
//!
//! A datachannel multiplexes a single plugin's traffic over the shared
//! transport connection, applying CCH to every message. The daemon side
//! opens the session, pipelines Data messages and drives recovery; the
//! agent side validates, acks and feeds the plugin.

pub mod agent;
pub mod daemon;
pub mod plugin;

pub use agent::AgentDataChannel;
pub use daemon::{DataChannel, DataChannelConfig};
pub use plugin::{AgentPlugin, PluginError, PluginEvent, PluginHandle, PluginInput};

use std::time::Duration;

use thiserror::Error;

use bolthole_cch::CchError;
use bolthole_transport::TransportError;
use bolthole_types::{
    ErrorMessage, IDLE_TIMEOUT_ERR_MSG, POLICY_DELETED_ERR_MSG, POLICY_EDITED_ERR_MSG,
    USER_NOT_FOUND_ERR_MSG,
};

/// How long the daemon waits for a SynAck before giving up
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Handshake attempts before a peer error is surfaced
pub const HANDSHAKE_RETRIES: u32 = 3;

/// A week of silence closes the channel. Long-running sessions lean on
/// this being generous; do not shorten it without a compensating control.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Grace period for outstanding acks when closing after plugin completion
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DataChannelError {
    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("IdleTimeoutConnectionClosedError: no traffic for the idle window")]
    IdleTimeout,

    #[error("PolicyEditedConnectionClosedError: an access policy changed")]
    PolicyEditedClosed,

    #[error("PolicyDeletedConnectionClosedError: an access policy was removed")]
    PolicyDeletedClosed,

    #[error("UserNotFoundError: target user does not exist")]
    UserNotFound,

    #[error("BZCertIdTokenError: {0}")]
    CertIdToken(String),

    #[error("protocol engine already attached to a datachannel")]
    EngineAttached,

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Cch(#[from] CchError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("peer error: {0}")]
    Peer(String),

    #[error("datachannel closed")]
    Closed,
}

impl DataChannelError {
    /// Convert a peer-reported error into a typed local error. Matching is
    /// by substring on wording the peer controls; the strings must track
    /// the peer's exactly.
    pub fn from_peer(error: &ErrorMessage) -> Self {
        let text = &error.message;
        if text.contains(USER_NOT_FOUND_ERR_MSG) {
            DataChannelError::UserNotFound
        } else if text.contains(POLICY_EDITED_ERR_MSG) {
            DataChannelError::PolicyEditedClosed
        } else if text.contains(POLICY_DELETED_ERR_MSG) {
            DataChannelError::PolicyDeletedClosed
        } else if text.contains(IDLE_TIMEOUT_ERR_MSG) {
            DataChannelError::IdleTimeout
        } else if text.contains("id token verification failed")
            || text.contains("client certificate expired")
        {
            DataChannelError::CertIdToken(error.message.clone())
        } else {
            DataChannelError::Peer(error.message.clone())
        }
    }

    /// Errors that end the session regardless of retry budget
    pub fn is_fatal_peer_error(&self) -> bool {
        matches!(
            self,
            DataChannelError::UserNotFound
                | DataChannelError::PolicyEditedClosed
                | DataChannelError::PolicyDeletedClosed
                | DataChannelError::IdleTimeout
                | DataChannelError::CertIdToken(_)
        )
    }
}

pub type DataChannelResult<T> = Result<T, DataChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_error(message: &str) -> ErrorMessage {
        ErrorMessage {
            schema_version: "2.1".to_string(),
            error_type: "KeysplittingValidationError".to_string(),
            message: message.to_string(),
            h_pointer: String::new(),
        }
    }

    #[test]
    fn test_known_peer_errors_become_typed() {
        assert!(matches!(
            DataChannelError::from_peer(&peer_error("target rejected: UserNotFoundError for ec2-user")),
            DataChannelError::UserNotFound
        ));
        assert!(matches!(
            DataChannelError::from_peer(&peer_error("PolicyDeletedConnectionClosedError")),
            DataChannelError::PolicyDeletedClosed
        ));
    }

    #[test]
    fn test_unknown_peer_errors_stay_generic() {
        let error = DataChannelError::from_peer(&peer_error("something else entirely"));
        assert!(matches!(error, DataChannelError::Peer(_)));
        assert!(!error.is_fatal_peer_error());
    }
}
