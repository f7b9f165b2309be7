//! Agent-side datachannel
//!
//! Spawned by the control channel when the bastion requests a plugin
//! session. Validates every inbound CCH message, acks it, hands action
//! payloads to the plugin, and forwards the plugin's stream frames to the
//! daemon. Validation failures are reported to the peer as Error messages
//! bound to the offending hash; chain violations leave the session alive
//! so the daemon can recover, identity violations end it.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bolthole_cch::{AgentCch, CchError, CertVerify, CCH_SCHEMA_VERSION};
use bolthole_transport::{Transport, TransportError};
use bolthole_types::{
    AgentMessage, CchMessage, CchPayload, CloseDataChannelPayload, ErrorMessage, MessageType,
    StreamMessage,
};

use crate::plugin::AgentPlugin;
use crate::{DataChannelError, DataChannelResult};

pub struct AgentDataChannel {
    id: String,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<DataChannelResult<()>>>>,
}

impl AgentDataChannel {
    pub fn spawn<V: CertVerify + 'static>(
        transport: Arc<dyn Transport>,
        cch: AgentCch<V>,
        plugin: Box<dyn AgentPlugin>,
        channel_id: impl Into<String>,
    ) -> Self {
        let id = channel_id.into();
        let transport_rx = transport.subscribe(&id);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            id.clone(),
            transport,
            cch,
            plugin,
            transport_rx,
            cancel.clone(),
        ));

        Self {
            id,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn done(&self) -> DataChannelResult<()> {
        let handle = self.handle.lock().await.take();
        match handle {
            Some(handle) => handle.await.unwrap_or(Err(DataChannelError::Closed)),
            None => Err(DataChannelError::Closed),
        }
    }
}

async fn run<V: CertVerify>(
    id: String,
    transport: Arc<dyn Transport>,
    mut cch: AgentCch<V>,
    mut plugin: Box<dyn AgentPlugin>,
    transport_rx: mpsc::UnboundedReceiver<AgentMessage>,
    cancel: CancellationToken,
) -> DataChannelResult<()> {
    let stream_rx = plugin.take_outbox();
    let result = pump(
        &id,
        transport.as_ref(),
        &mut cch,
        &mut plugin,
        transport_rx,
        stream_rx,
        &cancel,
    )
    .await;

    plugin.kill().await;
    if let Ok(frame) = AgentMessage::wrap(
        &id,
        MessageType::CloseDataChannel,
        &CloseDataChannelPayload {
            reason: match &result {
                Ok(()) => "session complete".to_string(),
                Err(e) => e.to_string(),
            },
        },
    ) {
        let _ = transport.send(frame).await;
    }
    transport.unsubscribe(&id);

    match &result {
        Ok(()) => info!(channel_id = %id, "agent datachannel closed"),
        Err(e) => warn!(channel_id = %id, error = %e, "agent datachannel failed"),
    }
    result
}

/// The stream-forwarding loop and the inbound loop run as concurrently
/// polled futures: a plugin may emit stream frames from inside
/// `receive`, so forwarding must not wait for the inbound handler to
/// return.
async fn pump<V: CertVerify>(
    id: &str,
    transport: &dyn Transport,
    cch: &mut AgentCch<V>,
    plugin: &mut Box<dyn AgentPlugin>,
    mut transport_rx: mpsc::UnboundedReceiver<AgentMessage>,
    mut stream_rx: Option<mpsc::Receiver<StreamMessage>>,
    cancel: &CancellationToken,
) -> DataChannelResult<()> {
    let stream_loop = async {
        loop {
            let Some(stream) = recv_stream(&mut stream_rx).await else {
                // Plugin dropped its stream sender; nothing more to forward.
                std::future::pending::<()>().await;
                continue;
            };
            transport
                .send(AgentMessage::wrap(id, MessageType::Stream, &stream)?)
                .await?;
        }
    };

    let inbound_loop = async {
        loop {
            let Some(frame) = transport_rx.recv().await else {
                return Err(TransportError::Closed.into());
            };
            match frame.message_type {
                MessageType::Keysplitting => {
                    let message: CchMessage = frame.parse()?;
                    handle_cch_message(id, transport, cch, plugin, &message).await?;
                }
                MessageType::CloseDataChannel => return Ok(()),
                MessageType::Error => {
                    if let Ok(error) = frame.parse::<ErrorMessage>() {
                        warn!(channel_id = %id, error = %error.message, "daemon reported an error");
                    }
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        end = stream_loop => end,
        end = inbound_loop => end,
        _ = cancel.cancelled() => Ok(()),
    }
}

async fn handle_cch_message<V: CertVerify>(
    id: &str,
    transport: &dyn Transport,
    cch: &mut AgentCch<V>,
    plugin: &mut Box<dyn AgentPlugin>,
    message: &CchMessage,
) -> DataChannelResult<()> {
    match cch.validate(message).await {
        Ok(()) => {
            let (action, payload) = match &message.payload {
                CchPayload::Syn(p) => (p.action.clone(), None),
                CchPayload::Data(p) => (p.action.clone(), Some(p.action_payload.clone())),
                // validate() rejects ack variants before we get here
                _ => return Ok(()),
            };

            // The ack goes first so the chain advances even if the plugin
            // is slow; it carries no response payload by contract.
            let ack = cch.build_ack(message, &action, Vec::new())?;
            transport
                .send(AgentMessage::wrap(id, MessageType::Keysplitting, &ack)?)
                .await?;

            if let Some(payload) = payload {
                if let Err(e) = plugin.receive(&action, &payload).await {
                    send_error(transport, id, message, "PluginError", &e.to_string()).await;
                    return Err(e.into());
                }
            }
            Ok(())
        }
        Err(e) => {
            send_error(transport, id, message, error_kind(&e), &e.to_string()).await;
            if is_fatal_validation_error(&e) {
                Err(e.into())
            } else {
                // Chain mismatches stay soft: the daemon answers the error
                // with a recovery Syn on this same channel.
                Ok(())
            }
        }
    }
}

fn is_fatal_validation_error(error: &CchError) -> bool {
    matches!(
        error,
        CchError::InvalidSignature(_)
            | CchError::CertHashMismatch
            | CchError::CertExpired(_)
            | CchError::Cert(_)
            | CchError::TargetMismatch { .. }
    )
}

fn error_kind(error: &CchError) -> &'static str {
    match error {
        CchError::InvalidSignature(_) => "InvalidSignature",
        CchError::ChainMismatch { .. } => "ChainMismatch",
        CchError::TargetMismatch { .. } => "TargetMismatch",
        CchError::CertHashMismatch => "CertHashMismatch",
        CchError::CertExpired(_) => "CertExpired",
        CchError::Cert(_) => "CertificateValidationError",
        CchError::UnknownHPointer(_) => "UnknownHPointer",
        _ => "KeysplittingValidationError",
    }
}

async fn send_error(
    transport: &dyn Transport,
    id: &str,
    offending: &CchMessage,
    kind: &str,
    message: &str,
) {
    let error = ErrorMessage {
        schema_version: CCH_SCHEMA_VERSION.to_string(),
        error_type: kind.to_string(),
        message: message.to_string(),
        h_pointer: offending.hash().unwrap_or_default(),
    };
    match AgentMessage::wrap(id, MessageType::Error, &error) {
        Ok(frame) => {
            let _ = transport.send(frame).await;
        }
        Err(e) => warn!(error = %e, "failed to frame error message"),
    }
}

async fn recv_stream(rx: &mut Option<mpsc::Receiver<StreamMessage>>) -> Option<StreamMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
