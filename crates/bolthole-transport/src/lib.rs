//! Bolthole Transport - framed JSON message delivery
//!
//! The transport carries [`AgentMessage`] frames over a single full-duplex
//! stream shared by every channel on a connection, routing inbound frames
//! by channel id. Writes are serialised internally; reconnection is the
//! transport's own concern and is surfaced only through [`Transport::is_up`].

pub mod memory;
pub mod websocket;

pub use memory::MemoryTransport;
pub use websocket::WebsocketTransport;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use bolthole_types::AgentMessage;

/// Upper bound on how long the websocket client keeps retrying a broken
/// connection. The control monitor derives its missed-pong budget from
/// this value.
pub const MAX_RECONNECT_WAIT_TIME: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is down")]
    Down,

    #[error("transport closed")]
    Closed,

    #[error("frame serialisation failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("websocket failure: {0}")]
    Websocket(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// The contract every transport implementation satisfies
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue one frame for delivery to the peer
    async fn send(&self, message: AgentMessage) -> TransportResult<()>;

    /// Receive all future inbound frames for a channel id
    fn subscribe(&self, channel_id: &str) -> mpsc::UnboundedReceiver<AgentMessage>;

    /// Stop receiving frames for a channel id
    fn unsubscribe(&self, channel_id: &str);

    /// Whether the underlying connection is currently established
    fn is_up(&self) -> bool;
}
