//! The control channel endpoint

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bolthole_transport::Transport;
use bolthole_types::{AgentMessage, MessageType, OpenDataChannelPayload, PongPayload};

use crate::{ControlChannelError, DEFAULT_HEART_RATE, MANUAL_RESTART_MSG};

/// Creates a plugin datachannel for a bastion request. Each spawn builds a
/// fresh protocol engine; the control channel never touches CCH itself.
#[async_trait]
pub trait DataChannelSpawner: Send + Sync {
    async fn spawn(&self, request: OpenDataChannelPayload) -> Result<(), ControlChannelError>;
}

pub struct ControlChannelConfig {
    pub channel_id: String,
    pub target_id: String,
    pub heart_rate: Duration,
}

impl ControlChannelConfig {
    pub fn new(channel_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            target_id: target_id.into(),
            heart_rate: DEFAULT_HEART_RATE,
        }
    }
}

/// Receiver ends consumed by the control monitor
pub struct ControlHandles {
    /// One tick per successfully emitted pong
    pub pongs: mpsc::UnboundedReceiver<()>,
    /// Restart requests, carrying the shutdown reason to persist
    pub restarts: mpsc::UnboundedReceiver<String>,
    /// Non-fatal errors for asynchronous reporting to the bastion
    pub runtime_errors: mpsc::UnboundedReceiver<ControlChannelError>,
}

pub struct ControlChannel {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    done: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    pub fn start(
        config: ControlChannelConfig,
        transport: Arc<dyn Transport>,
        spawner: Arc<dyn DataChannelSpawner>,
    ) -> (Self, ControlHandles) {
        let (pong_tx, pongs) = mpsc::unbounded_channel();
        let (restart_tx, restarts) = mpsc::unbounded_channel();
        let (err_tx, runtime_errors) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let handle = tokio::spawn(run(
            config,
            transport.clone(),
            spawner,
            pong_tx,
            restart_tx,
            err_tx,
            cancel.clone(),
            done.clone(),
        ));

        (
            Self {
                transport,
                cancel,
                done,
                handle: Mutex::new(Some(handle)),
            },
            ControlHandles {
                pongs,
                restarts,
                runtime_errors,
            },
        )
    }

    /// Pongs are only expected while the transport is connected; during a
    /// reconnect the monitor extends its patience instead of restarting.
    pub fn should_be_sending_pongs(&self) -> bool {
        self.transport.is_up()
    }

    /// Cancelled when the channel's task has exited
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn join(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config: ControlChannelConfig,
    transport: Arc<dyn Transport>,
    spawner: Arc<dyn DataChannelSpawner>,
    pong_tx: mpsc::UnboundedSender<()>,
    restart_tx: mpsc::UnboundedSender<String>,
    err_tx: mpsc::UnboundedSender<ControlChannelError>,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    let _done_guard = done.drop_guard();
    let mut inbound = transport.subscribe(&config.channel_id);
    let mut heartbeat = tokio::time::interval(config.heart_rate);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                transport.unsubscribe(&config.channel_id);
                return;
            }

            _ = heartbeat.tick() => {
                if !transport.is_up() {
                    continue;
                }
                let pong = AgentMessage::wrap(
                    &config.channel_id,
                    MessageType::Pong,
                    &PongPayload {
                        target_id: config.target_id.clone(),
                        timestamp: Utc::now().timestamp(),
                    },
                );
                match pong {
                    Ok(frame) => {
                        if transport.send(frame).await.is_ok() {
                            let _ = pong_tx.send(());
                        }
                    }
                    Err(e) => {
                        let _ = err_tx.send(ControlChannelError::Malformed(e));
                    }
                }
            }

            frame = inbound.recv() => {
                let Some(frame) = frame else {
                    // Subscription dropped underneath us; the monitor sees
                    // this as the channel being done.
                    return;
                };
                match frame.message_type {
                    MessageType::OpenDataChannel => match frame.parse::<OpenDataChannelPayload>() {
                        Ok(request) => {
                            info!(channel_id = %request.channel_id, action = %request.action, "opening datachannel");
                            if let Err(e) = spawner.spawn(request).await {
                                warn!(error = %e, "datachannel spawn failed");
                                let _ = err_tx.send(e);
                            }
                        }
                        Err(e) => {
                            let _ = err_tx.send(ControlChannelError::Malformed(e));
                        }
                    },
                    MessageType::Restart => {
                        info!("bastion requested a restart");
                        let _ = restart_tx.send(MANUAL_RESTART_MSG.to_string());
                    }
                    MessageType::CloseDataChannel => return,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolthole_transport::MemoryTransport;

    struct RecordingSpawner {
        requests: Mutex<Vec<OpenDataChannelPayload>>,
    }

    #[async_trait]
    impl DataChannelSpawner for RecordingSpawner {
        async fn spawn(&self, request: OpenDataChannelPayload) -> Result<(), ControlChannelError> {
            self.requests.lock().await.push(request);
            Ok(())
        }
    }

    fn fast_config() -> ControlChannelConfig {
        let mut config = ControlChannelConfig::new("control", "target-1");
        config.heart_rate = Duration::from_millis(10);
        config
    }

    #[tokio::test]
    async fn test_pongs_flow_while_transport_is_up() {
        let (agent_side, bastion_side) = MemoryTransport::pair();
        let mut bastion_rx = bastion_side.subscribe("control");
        let spawner = Arc::new(RecordingSpawner {
            requests: Mutex::new(Vec::new()),
        });
        let (channel, mut handles) =
            ControlChannel::start(fast_config(), Arc::new(agent_side), spawner);

        let frame = bastion_rx.recv().await.unwrap();
        assert_eq!(frame.message_type, MessageType::Pong);
        handles.pongs.recv().await.unwrap();
        assert!(channel.should_be_sending_pongs());

        channel.close();
        channel.join().await;
    }

    #[tokio::test]
    async fn test_pongs_pause_while_transport_is_down() {
        let (agent_side, _bastion_side) = MemoryTransport::pair();
        agent_side.set_up(false);
        let spawner = Arc::new(RecordingSpawner {
            requests: Mutex::new(Vec::new()),
        });
        let (channel, mut handles) =
            ControlChannel::start(fast_config(), Arc::new(agent_side), spawner);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handles.pongs.try_recv().is_err());
        assert!(!channel.should_be_sending_pongs());

        channel.close();
        channel.join().await;
    }

    #[tokio::test]
    async fn test_open_requests_reach_the_spawner() {
        let (agent_side, bastion_side) = MemoryTransport::pair();
        let spawner = Arc::new(RecordingSpawner {
            requests: Mutex::new(Vec::new()),
        });
        let (channel, _handles) =
            ControlChannel::start(fast_config(), Arc::new(agent_side), spawner.clone());

        let open = AgentMessage::wrap(
            "control",
            MessageType::OpenDataChannel,
            &OpenDataChannelPayload {
                channel_id: "dc-1".to_string(),
                action: "shell/open".to_string(),
            },
        )
        .unwrap();
        bastion_side.send(open).await.unwrap();

        // The spawn happens on the channel task; give it a beat.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let requests = spawner.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].channel_id, "dc-1");
        drop(requests);

        channel.close();
        channel.join().await;
    }

    #[tokio::test]
    async fn test_restart_request_is_forwarded() {
        let (agent_side, bastion_side) = MemoryTransport::pair();
        let spawner = Arc::new(RecordingSpawner {
            requests: Mutex::new(Vec::new()),
        });
        let (channel, mut handles) =
            ControlChannel::start(fast_config(), Arc::new(agent_side), spawner);

        let restart = AgentMessage {
            channel_id: "control".to_string(),
            message_type: MessageType::Restart,
            schema_version: "1.1".to_string(),
            payload: b"{}".to_vec(),
        };
        bastion_side.send(restart).await.unwrap();

        let reason = handles.restarts.recv().await.unwrap();
        assert_eq!(reason, MANUAL_RESTART_MSG);

        channel.close();
        channel.join().await;
    }
}
