//! Bolthole Control - the agent's permanent channel to the bastion
//!
//! The control channel outlives every datachannel: it emits heartbeat
//! pongs while the transport is up, spawns plugin datachannels on bastion
//! request, and surfaces runtime errors without blocking. The control
//! monitor watches the pong stream and triggers a qualified restart when
//! liveness breaks.

pub mod channel;
pub mod monitor;

pub use channel::{ControlChannel, ControlChannelConfig, ControlHandles, DataChannelSpawner};
pub use monitor::{ControlMonitor, MonitorOutcome};

use std::time::Duration;

use thiserror::Error;

use bolthole_transport::TransportError;

/// One pong per heart beat while the transport is up
pub const DEFAULT_HEART_RATE: Duration = Duration::from_secs(60);

/// Shutdown reason recorded when the monitor loses the pong stream
pub const STOPPED_PROCESSING_PONGS_MSG: &str = "control channel stopped processing pongs";

/// Shutdown reason recorded for a bastion-requested restart
pub const MANUAL_RESTART_MSG: &str = "received manual restart request";

/// Whether a persisted shutdown reason merits a restart report to the
/// bastion on the next boot
pub fn is_qualified_shutdown(reason: &str) -> bool {
    reason == STOPPED_PROCESSING_PONGS_MSG || reason.contains(MANUAL_RESTART_MSG)
}

#[derive(Debug, Error)]
pub enum ControlChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed control frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("failed to spawn datachannel: {0}")]
    Spawn(String),
}

pub type ControlResult<T> = Result<T, ControlChannelError>;
