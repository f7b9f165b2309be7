//! Daemon-side datachannel
//!
//! Owns one CCH session end to end: announces the channel, completes the
//! handshake (with bounded retries on peer errors), then pumps three
//! sources concurrently (plugin events into the protocol engine, engine
//! output onto the transport, inbound frames back into the engine and
//! plugin) until the plugin finishes, the peer closes, an error is
//! fatal, or the idle window elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bolthole_cch::{CchError, CertProvider, DaemonCch};
use bolthole_transport::{Transport, TransportError};
use bolthole_types::{
    AgentMessage, CchMessage, CchPayload, CloseDataChannelPayload, ErrorMessage, MessageType,
    OpenDataChannelPayload, StreamMessage,
};

use crate::plugin::{PluginEvent, PluginHandle, PluginInput};
use crate::{
    DataChannelError, DataChannelResult, DRAIN_TIMEOUT, HANDSHAKE_RETRIES, HANDSHAKE_TIMEOUT,
    IDLE_TIMEOUT,
};

pub struct DataChannelConfig {
    pub action: String,
    pub syn_payload: Vec<u8>,
    /// Reuse an existing channel id instead of announcing a new channel
    pub channel_id: Option<String>,
    /// Attach to a session the agent already holds open
    pub attach: bool,
    /// Wait for outstanding acks before closing once the plugin finishes
    pub drain_on_close: bool,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

impl DataChannelConfig {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            syn_payload: Vec::new(),
            channel_id: None,
            attach: false,
            drain_on_close: true,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

pub struct DataChannel<P: CertProvider + 'static> {
    id: String,
    cch: Arc<DaemonCch<P>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<DataChannelResult<()>>>>,
}

impl<P: CertProvider + 'static> DataChannel<P> {
    /// Open a new session: announce the channel (unless attaching), send
    /// the Syn and wait for a validated SynAck, then start the pumps.
    pub async fn open(
        transport: Arc<dyn Transport>,
        cch: Arc<DaemonCch<P>>,
        plugin: PluginHandle,
        config: DataChannelConfig,
    ) -> DataChannelResult<Self> {
        let id = config
            .channel_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut transport_rx = transport.subscribe(&id);
        let mut cch_outbox = cch.take_outbox().ok_or(DataChannelError::EngineAttached)?;

        if !config.attach {
            let open = AgentMessage::wrap(
                &id,
                MessageType::OpenDataChannel,
                &OpenDataChannelPayload {
                    channel_id: id.clone(),
                    action: config.action.clone(),
                },
            )?;
            transport.send(open).await?;
        }

        cch.open(&config.action, config.syn_payload.clone()).await?;
        handshake(
            &id,
            transport.as_ref(),
            &cch,
            &mut transport_rx,
            &mut cch_outbox,
            &config,
        )
        .await?;
        info!(channel_id = %id, action = %config.action, "datachannel open");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            id.clone(),
            transport,
            cch.clone(),
            plugin,
            transport_rx,
            cch_outbox,
            config.drain_on_close,
            config.idle_timeout,
            cancel.clone(),
        ));

        Ok(Self {
            id,
            cch,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Submit one plugin frame directly, subject to the pipeline window
    pub async fn send_plugin_output(&self, action: &str, payload: Vec<u8>) -> DataChannelResult<()> {
        Ok(self.cch.inbox(action, payload).await?)
    }

    /// Ask the channel to shut down; `done` reports the outcome
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the channel to finish and collect its final status
    pub async fn done(&self) -> DataChannelResult<()> {
        let handle = self.handle.lock().await.take();
        match handle {
            Some(handle) => handle.await.unwrap_or(Err(DataChannelError::Closed)),
            None => Err(DataChannelError::Closed),
        }
    }
}

async fn handshake<P: CertProvider>(
    id: &str,
    transport: &dyn Transport,
    cch: &DaemonCch<P>,
    transport_rx: &mut mpsc::UnboundedReceiver<AgentMessage>,
    cch_outbox: &mut mpsc::UnboundedReceiver<CchMessage>,
    config: &DataChannelConfig,
) -> DataChannelResult<()> {
    tokio::time::timeout(config.handshake_timeout, async {
        let mut attempts = 1u32;
        loop {
            tokio::select! {
                Some(message) = cch_outbox.recv() => {
                    transport
                        .send(AgentMessage::wrap(id, MessageType::Keysplitting, &message)?)
                        .await?;
                }
                inbound = transport_rx.recv() => {
                    let Some(frame) = inbound else {
                        return Err(TransportError::Closed.into());
                    };
                    match frame.message_type {
                        MessageType::Keysplitting => {
                            let message: CchMessage = frame.parse()?;
                            cch.validate(&message).await?;
                            if cch.is_handshake_complete().await {
                                return Ok(());
                            }
                        }
                        MessageType::Error => {
                            let error: ErrorMessage = frame.parse()?;
                            let typed = DataChannelError::from_peer(&error);
                            if typed.is_fatal_peer_error() {
                                return Err(typed);
                            }
                            attempts += 1;
                            if attempts > HANDSHAKE_RETRIES {
                                return Err(typed);
                            }
                            warn!(attempt = attempts, error = %error.message, "handshake rejected, retrying");
                            cch.open(&config.action, config.syn_payload.clone()).await?;
                        }
                        _ => {}
                    }
                }
            }
        }
    })
    .await
    .map_err(|_| DataChannelError::HandshakeTimeout)?
}

#[allow(clippy::too_many_arguments)]
async fn run<P: CertProvider>(
    id: String,
    transport: Arc<dyn Transport>,
    cch: Arc<DaemonCch<P>>,
    plugin: PluginHandle,
    transport_rx: mpsc::UnboundedReceiver<AgentMessage>,
    cch_outbox: mpsc::UnboundedReceiver<CchMessage>,
    drain_on_close: bool,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> DataChannelResult<()> {
    let result = pump(
        &id,
        transport.as_ref(),
        &cch,
        plugin,
        transport_rx,
        cch_outbox,
        drain_on_close,
        idle_timeout,
        &cancel,
    )
    .await;

    cch.shutdown();
    let reason = match &result {
        Ok(()) => "session complete".to_string(),
        Err(e) => e.to_string(),
    };
    if let Ok(frame) = AgentMessage::wrap(
        &id,
        MessageType::CloseDataChannel,
        &CloseDataChannelPayload {
            reason: reason.clone(),
        },
    ) {
        let _ = transport.send(frame).await;
    }
    transport.unsubscribe(&id);

    match &result {
        Ok(()) => info!(channel_id = %id, "datachannel closed"),
        Err(e) => warn!(channel_id = %id, error = %e, "datachannel failed"),
    }
    result
}

enum Flow {
    Continue,
    Close,
}

enum PumpEnd {
    PluginDone,
    PeerClosed,
}

/// The three session loops of a datachannel run as concurrently polled
/// futures on one task: the plugin loop may block for a long time on the
/// pipeline window, and only the inbound loop's ack processing can open
/// it again.
#[allow(clippy::too_many_arguments)]
async fn pump<P: CertProvider>(
    id: &str,
    transport: &dyn Transport,
    cch: &Arc<DaemonCch<P>>,
    plugin: PluginHandle,
    mut transport_rx: mpsc::UnboundedReceiver<AgentMessage>,
    mut cch_outbox: mpsc::UnboundedReceiver<CchMessage>,
    drain_on_close: bool,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> DataChannelResult<()> {
    let PluginHandle { mut events, inputs } = plugin;
    let last_activity = std::sync::Mutex::new(tokio::time::Instant::now());
    let touch = || {
        if let Ok(mut at) = last_activity.lock() {
            *at = tokio::time::Instant::now();
        }
    };

    let plugin_loop = async {
        loop {
            match events.recv().await {
                Some(PluginEvent::Output { action, payload }) => {
                    cch.inbox(&action, payload).await?;
                    touch();
                }
                Some(PluginEvent::Failed(e)) => return Err(e.into()),
                None => return Ok(PumpEnd::PluginDone),
            }
        }
    };

    let outbox_loop = async {
        loop {
            let Some(message) = cch_outbox.recv().await else {
                return Err(DataChannelError::Closed);
            };
            transport
                .send(AgentMessage::wrap(id, MessageType::Keysplitting, &message)?)
                .await?;
            touch();
        }
    };

    let inbound_loop = async {
        loop {
            let Some(frame) = transport_rx.recv().await else {
                return Err(TransportError::Closed.into());
            };
            touch();
            match handle_inbound(cch, &inputs, frame).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(PumpEnd::PeerClosed),
            }
        }
    };

    let idle_loop = async {
        let check_period = (idle_timeout / 4)
            .min(Duration::from_secs(60))
            .max(Duration::from_millis(10));
        loop {
            tokio::time::sleep(check_period).await;
            let idle_for = last_activity
                .lock()
                .map(|at| at.elapsed())
                .unwrap_or(idle_timeout);
            if idle_for >= idle_timeout {
                return DataChannelError::IdleTimeout;
            }
        }
    };

    let ended = tokio::select! {
        end = plugin_loop => end,
        end = outbox_loop => end,
        end = inbound_loop => end,
        idle = idle_loop => Err(idle),
        _ = cancel.cancelled() => Err(DataChannelError::Closed),
    };

    match ended? {
        PumpEnd::PluginDone => {
            if drain_on_close {
                drain(id, transport, cch, &mut transport_rx, &mut cch_outbox).await;
            }
            Ok(())
        }
        PumpEnd::PeerClosed => Ok(()),
    }
}

async fn handle_inbound<P: CertProvider>(
    cch: &Arc<DaemonCch<P>>,
    inputs: &mpsc::Sender<PluginInput>,
    frame: AgentMessage,
) -> DataChannelResult<Flow> {
    match frame.message_type {
        MessageType::Keysplitting => {
            let message: CchMessage = frame.parse()?;
            match cch.validate(&message).await {
                Ok(()) => {
                    // Ack response payloads (SynAck attach state mostly)
                    // flow back to the plugin.
                    let (action, payload) = match &message.payload {
                        CchPayload::SynAck(p) => (&p.action, &p.action_response_payload),
                        CchPayload::DataAck(p) => (&p.action, &p.action_response_payload),
                        _ => return Ok(Flow::Continue),
                    };
                    if !payload.is_empty() {
                        let _ = inputs
                            .send(PluginInput::Response {
                                action: action.clone(),
                                payload: payload.clone(),
                            })
                            .await;
                    }
                }
                Err(CchError::UnknownHPointer(hash)) => {
                    // A duplicate or post-recovery ack; the chain has moved
                    // past it.
                    debug!(%hash, "ignoring ack for unknown hpointer");
                }
                Err(e) => return Err(e.into()),
            }
            Ok(Flow::Continue)
        }
        MessageType::Stream => {
            let stream: StreamMessage = frame.parse()?;
            let _ = inputs.send(PluginInput::Stream(stream)).await;
            Ok(Flow::Continue)
        }
        MessageType::Error => {
            let error: ErrorMessage = frame.parse()?;
            let typed = DataChannelError::from_peer(&error);
            if typed.is_fatal_peer_error() {
                return Err(typed);
            }
            match cch.recover(&error).await {
                Ok(true) => debug!(error = %error.message, "recovery started"),
                Ok(false) => debug!(error = %error.message, "ignoring peer error"),
                Err(e) => return Err(e.into()),
            }
            Ok(Flow::Continue)
        }
        MessageType::CloseDataChannel => Ok(Flow::Close),
        _ => Ok(Flow::Continue),
    }
}

/// Keep pumping acks for up to the drain window so the pipeline empties
/// before the close goes out.
async fn drain<P: CertProvider>(
    id: &str,
    transport: &dyn Transport,
    cch: &Arc<DaemonCch<P>>,
    transport_rx: &mut mpsc::UnboundedReceiver<AgentMessage>,
    cch_outbox: &mut mpsc::UnboundedReceiver<CchMessage>,
) {
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
        loop {
            if cch.pipeline_len().await == 0 {
                return;
            }
            tokio::select! {
                Some(message) = cch_outbox.recv() => {
                    if let Ok(frame) = AgentMessage::wrap(id, MessageType::Keysplitting, &message) {
                        let _ = transport.send(frame).await;
                    }
                }
                inbound = transport_rx.recv() => {
                    let Some(frame) = inbound else { return };
                    if frame.message_type == MessageType::Keysplitting {
                        if let Ok(message) = frame.parse::<CchMessage>() {
                            let _ = cch.validate(&message).await;
                        }
                    }
                }
            }
        }
    })
    .await;
}
