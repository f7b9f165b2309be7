//! The control monitor
//!
//! One loop at the agent level watches the control channel's pong stream
//! on a timer of three heart beats. A quiet interval while the transport
//! is reconnecting only increments a bounded miss counter; a quiet
//! interval while pongs should be flowing, or an exhausted counter,
//! triggers a restart with a reason the next process generation reports
//! to the bastion.

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bolthole_transport::MAX_RECONNECT_WAIT_TIME;

use crate::channel::{ControlChannel, ControlHandles};
use crate::STOPPED_PROCESSING_PONGS_MSG;

/// Why the monitor stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Restart the agent, persisting this reason for the next boot
    Restart { reason: String },
    /// Cooperative shutdown (signal), nothing to report
    Shutdown,
}

pub struct ControlMonitor {
    check_interval: Duration,
    max_missed_pong_sets: u32,
}

impl ControlMonitor {
    pub fn new(heart_rate: Duration) -> Self {
        let check_interval = heart_rate * 3;
        let max_missed_pong_sets =
            (MAX_RECONNECT_WAIT_TIME.as_millis() / check_interval.as_millis().max(1)) as u32;
        Self {
            check_interval,
            max_missed_pong_sets: max_missed_pong_sets.max(1),
        }
    }

    /// Cap the reconnect patience (tests shrink this)
    pub fn with_max_missed_pong_sets(mut self, max: u32) -> Self {
        self.max_missed_pong_sets = max.max(1);
        self
    }

    pub async fn run(
        &self,
        control: &ControlChannel,
        handles: &mut ControlHandles,
        cancel: &CancellationToken,
    ) -> MonitorOutcome {
        let done = control.done_token();
        let mut ticker = interval_at(
            Instant::now() + self.check_interval,
            self.check_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut missed_sets = 0u32;
        let mut pong_seen = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return MonitorOutcome::Shutdown,

                _ = done.cancelled() => {
                    warn!("control channel ended, restarting");
                    return MonitorOutcome::Restart {
                        reason: "control channel closed".to_string(),
                    };
                }

                Some(()) = handles.pongs.recv() => {
                    pong_seen = true;
                }

                Some(reason) = handles.restarts.recv() => {
                    info!(%reason, "restart requested");
                    control.close();
                    return MonitorOutcome::Restart { reason };
                }

                _ = ticker.tick() => {
                    if pong_seen {
                        pong_seen = false;
                        missed_sets = 0;
                    } else if !control.should_be_sending_pongs()
                        && missed_sets < self.max_missed_pong_sets
                    {
                        missed_sets += 1;
                        warn!(missed_sets, "no pongs while transport reconnects");
                    } else {
                        warn!("pong stream lost, restarting");
                        control.close();
                        return MonitorOutcome::Restart {
                            reason: STOPPED_PROCESSING_PONGS_MSG.to_string(),
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ControlChannelConfig, DataChannelSpawner};
    use crate::ControlChannelError;
    use async_trait::async_trait;
    use bolthole_transport::{MemoryTransport, Transport};
    use bolthole_types::OpenDataChannelPayload;
    use std::sync::Arc;

    struct NoopSpawner;

    #[async_trait]
    impl DataChannelSpawner for NoopSpawner {
        async fn spawn(&self, _request: OpenDataChannelPayload) -> Result<(), ControlChannelError> {
            Ok(())
        }
    }

    fn start(heart_rate_ms: u64) -> (ControlChannel, ControlHandles, MemoryTransport) {
        let (agent_side, bastion_side) = MemoryTransport::pair();
        let mut config = ControlChannelConfig::new("control", "target-1");
        config.heart_rate = Duration::from_millis(heart_rate_ms);
        let (channel, handles) =
            ControlChannel::start(config, Arc::new(agent_side), Arc::new(NoopSpawner));
        (channel, handles, bastion_side)
    }

    #[tokio::test]
    async fn test_healthy_channel_keeps_running_until_cancelled() {
        let (channel, mut handles, _bastion) = start(10);
        let monitor = ControlMonitor::new(Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            canceller.cancel();
        });

        let outcome = monitor.run(&channel, &mut handles, &cancel).await;
        assert_eq!(outcome, MonitorOutcome::Shutdown);
        channel.close();
    }

    #[tokio::test]
    async fn test_silent_channel_with_live_transport_restarts() {
        let (channel, mut handles, bastion) = start(5000);
        // Heart rate is huge, so no pong arrives inside the monitor's
        // much shorter test window; the transport is up the whole time.
        let _ = bastion;
        let monitor =
            ControlMonitor::new(Duration::from_millis(10)).with_max_missed_pong_sets(3);
        let cancel = CancellationToken::new();

        let outcome = monitor.run(&channel, &mut handles, &cancel).await;
        assert_eq!(
            outcome,
            MonitorOutcome::Restart {
                reason: STOPPED_PROCESSING_PONGS_MSG.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_reconnecting_transport_exhausts_patience_then_restarts() {
        let (agent_side, _bastion_side) = MemoryTransport::pair();
        agent_side.set_up(false);
        let mut config = ControlChannelConfig::new("control", "target-1");
        config.heart_rate = Duration::from_millis(10);
        let (channel, mut handles) =
            ControlChannel::start(config, Arc::new(agent_side), Arc::new(NoopSpawner));

        let monitor =
            ControlMonitor::new(Duration::from_millis(10)).with_max_missed_pong_sets(2);
        let cancel = CancellationToken::new();

        let started = std::time::Instant::now();
        let outcome = monitor.run(&channel, &mut handles, &cancel).await;
        assert_eq!(
            outcome,
            MonitorOutcome::Restart {
                reason: STOPPED_PROCESSING_PONGS_MSG.to_string()
            }
        );
        // Two tolerated sets of 30ms each before the third check restarts.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_pong_resumption_resets_patience() {
        let (agent_side, _bastion_side) = MemoryTransport::pair();
        let agent_transport = Arc::new(agent_side);
        agent_transport.set_up(false);

        let mut config = ControlChannelConfig::new("control", "target-1");
        config.heart_rate = Duration::from_millis(10);
        let transport: Arc<dyn bolthole_transport::Transport> = agent_transport.clone();
        let (channel, mut handles) =
            ControlChannel::start(config, transport, Arc::new(NoopSpawner));

        // Down long enough to burn one missed set, then recover; with the
        // counter reset, the monitor must outlive the point where two
        // consecutive missed sets would have restarted it.
        let link = agent_transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            link.set_up(true);
        });

        let monitor =
            ControlMonitor::new(Duration::from_millis(10)).with_max_missed_pong_sets(2);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });

        let outcome = monitor.run(&channel, &mut handles, &cancel).await;
        assert_eq!(outcome, MonitorOutcome::Shutdown);
        channel.close();
    }

    #[tokio::test]
    async fn test_manual_restart_wins_immediately() {
        let (channel, mut handles, bastion) = start(10);
        let monitor = ControlMonitor::new(Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let restart = bolthole_types::AgentMessage {
            channel_id: "control".to_string(),
            message_type: bolthole_types::MessageType::Restart,
            schema_version: "1.1".to_string(),
            payload: b"{}".to_vec(),
        };
        bastion.send(restart).await.unwrap();

        let outcome = monitor.run(&channel, &mut handles, &cancel).await;
        assert!(matches!(
            outcome,
            MonitorOutcome::Restart { reason } if crate::is_qualified_shutdown(&reason)
        ));
    }
}
