//! Datachannel spawning for bastion plugin-open requests
//!
//! Each request gets a fresh agent CCH engine bound to the certificate
//! verifier built from this target's registration settings. Plugin
//! implementations register by action prefix; the loopback plugin covers
//! diagnostics, richer plugins plug in through the same seam.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use bolthole_bzcert::{BzCertVerifier, IdpProvider, VerifierConfig};
use bolthole_cch::AgentCch;
use bolthole_config::AgentConfig;
use bolthole_control::{ControlChannelError, DataChannelSpawner};
use bolthole_crypto::KeyPair;
use bolthole_datachannel::{AgentDataChannel, AgentPlugin, PluginError};
use bolthole_transport::Transport;
use bolthole_types::{OpenDataChannelPayload, StreamMessage};

pub struct AgentChannelSpawner {
    transport: Arc<dyn Transport>,
    keypair: KeyPair,
    verifier_config: VerifierConfig,
}

impl AgentChannelSpawner {
    pub fn new(
        transport: Arc<dyn Transport>,
        keypair: KeyPair,
        config: &AgentConfig,
    ) -> Result<Self, ControlChannelError> {
        let provider = IdpProvider::from_str(&config.idp_provider)
            .map_err(ControlChannelError::Spawn)?;
        Ok(Self {
            transport,
            keypair,
            verifier_config: VerifierConfig {
                provider,
                org_id: config.idp_org_id.clone(),
                allowed_jwks_url_patterns: config.jwks_url_patterns.clone(),
            },
        })
    }

    fn plugin_for(&self, action: &str) -> Result<Box<dyn AgentPlugin>, ControlChannelError> {
        match action.split('/').next().unwrap_or_default() {
            "loopback" => Ok(Box::new(LoopbackPlugin::new())),
            other => Err(ControlChannelError::Spawn(format!(
                "no plugin registered for action {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl DataChannelSpawner for AgentChannelSpawner {
    async fn spawn(&self, request: OpenDataChannelPayload) -> Result<(), ControlChannelError> {
        let verifier = BzCertVerifier::new(self.verifier_config.clone())
            .map_err(|e| ControlChannelError::Spawn(e.to_string()))?;
        let cch = AgentCch::new(self.keypair.clone(), verifier);
        let plugin = self.plugin_for(&request.action)?;

        let channel = AgentDataChannel::spawn(
            self.transport.clone(),
            cch,
            plugin,
            request.channel_id.clone(),
        );
        info!(channel_id = %channel.id(), action = %request.action, "datachannel spawned");

        // The channel owns its own lifecycle from here; completion and
        // failure are logged by its task.
        tokio::spawn(async move {
            let _ = channel.done().await;
        });
        Ok(())
    }
}

/// Echoes every frame back as a stream message; keeps connectivity
/// diagnosable without any real plugin attached.
struct LoopbackPlugin {
    stream_tx: Option<mpsc::Sender<StreamMessage>>,
    stream_rx: Option<mpsc::Receiver<StreamMessage>>,
    sequence: u64,
}

impl LoopbackPlugin {
    fn new() -> Self {
        let (stream_tx, stream_rx) = mpsc::channel(64);
        Self {
            stream_tx: Some(stream_tx),
            stream_rx: Some(stream_rx),
            sequence: 0,
        }
    }
}

#[async_trait]
impl AgentPlugin for LoopbackPlugin {
    async fn receive(&mut self, _action: &str, payload: &[u8]) -> Result<(), PluginError> {
        self.sequence += 1;
        if let Some(tx) = &self.stream_tx {
            tx.send(StreamMessage {
                stream_type: "loopback/echo".to_string(),
                sequence_number: self.sequence,
                more: true,
                content: payload.to_vec(),
            })
            .await
            .map_err(|_| PluginError::Internal("loopback stream closed".to_string()))?;
        }
        Ok(())
    }

    fn take_outbox(&mut self) -> Option<mpsc::Receiver<StreamMessage>> {
        self.stream_rx.take()
    }

    async fn kill(&mut self) {
        self.stream_tx = None;
    }
}
