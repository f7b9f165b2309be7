//! Plugin seams
//!
//! Plugin internals (shell, database, kube, web) live outside this crate;
//! only their contract with the datachannel appears here. Daemon-side
//! plugins exchange channel-backed events; agent-side plugins receive
//! validated action frames and push bulk results as Stream messages.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use bolthole_types::StreamMessage;

/// Terminal plugin failures. Several display strings double as wire
/// error markers matched by the peer; keep them verbatim.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("UserNotFoundError: no such user {0:?}")]
    UserNotFound(String),

    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("failed to connect to {0}")]
    ConnectionFailed(String),

    #[error("server {0} does not accept TLS connections")]
    TlsDisabled(String),

    #[error("failed to co-sign the client certificate: {0}")]
    ClientCertCosign(String),

    #[error("no key shard held for target {0}")]
    PwdbMissingKey(String),

    #[error("server certificate signed by an unknown authority: {0}")]
    PwdbUnknownAuthority(String),

    #[error("server certificate expired at {0}")]
    ServerCertificateExpired(String),

    #[error("server name {actual:?} does not match certificate {expected:?}")]
    IncorrectServerName { expected: String, actual: String },

    #[error("plugin failure: {0}")]
    Internal(String),
}

/// One event from a daemon-side plugin
#[derive(Debug)]
pub enum PluginEvent {
    /// A frame to submit to the protocol engine
    Output { action: String, payload: Vec<u8> },
    /// Terminal failure; the datachannel closes with this error
    Failed(PluginError),
}

/// A delivery into a daemon-side plugin
#[derive(Debug)]
pub enum PluginInput {
    /// Response payload carried on an ack
    Response { action: String, payload: Vec<u8> },
    /// Bulk data riding outside the CCH chain
    Stream(StreamMessage),
}

/// The channel pair joining a daemon-side plugin to its datachannel.
/// Closing the event sender marks the plugin done and starts the drain.
pub struct PluginHandle {
    pub events: mpsc::Receiver<PluginEvent>,
    pub inputs: mpsc::Sender<PluginInput>,
}

impl PluginHandle {
    /// A handle plus the plugin-side endpoints, for plugins and tests
    pub fn pair(
        buffer: usize,
    ) -> (
        PluginHandle,
        mpsc::Sender<PluginEvent>,
        mpsc::Receiver<PluginInput>,
    ) {
        let (event_tx, events) = mpsc::channel(buffer);
        let (inputs, input_rx) = mpsc::channel(buffer);
        (PluginHandle { events, inputs }, event_tx, input_rx)
    }
}

/// Agent-side plugin contract
#[async_trait]
pub trait AgentPlugin: Send {
    /// Accept one validated action frame. Bulk results flow through the
    /// stream outbox, not through the return value: acks stay empty so the
    /// daemon can predict their hashes.
    async fn receive(&mut self, action: &str, payload: &[u8]) -> Result<(), PluginError>;

    /// Stream frames to forward to the daemon; may only be taken once
    fn take_outbox(&mut self) -> Option<mpsc::Receiver<StreamMessage>>;

    /// Tear down any held resources
    async fn kill(&mut self);
}
