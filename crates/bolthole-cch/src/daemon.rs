//! Daemon-side CCH engine
//!
//! The daemon keeps an insertion-ordered pipeline of outbound messages
//! awaiting acknowledgement, bounded by the pipeline limit. Because more
//! than one Data may be in flight, the parent of a new Data is a
//! *predicted* ack: the DataAck the agent will deterministically produce
//! for the newest pipelined message. Agent errors trigger a bounded
//! recovery exchange that re-synchronises the chain through a fresh
//! Syn/SynAck and a selective resend.
//!
//! One mutex guards the whole state; [`DaemonCch::inbox`] waits on a
//! single notifier whenever the handshake is incomplete or the window is
//! full. Neither validation nor recovery performs I/O while holding the
//! lock.

use indexmap::IndexMap;
use tokio::sync::{mpsc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bolthole_crypto::{random_nonce, KeyPair, PublicKey};
use bolthole_types::{
    BzCert, CchMessage, CchPayload, DataAckPayload, DataPayload, ErrorMessage, SchemaVersion,
    SynAckPayload, SynPayload,
};

use crate::{
    CchError, CchResult, CertProvider, CCH_SCHEMA_VERSION, DEFAULT_PIPELINE_LIMIT,
    MAX_ERROR_RECOVERY_TRIES,
};

pub struct DaemonCchConfig {
    pub keypair: KeyPair,
    pub agent_public_key: PublicKey,
    pub pipeline_limit: usize,
}

impl DaemonCchConfig {
    pub fn new(keypair: KeyPair, agent_public_key: PublicKey) -> Self {
        Self {
            keypair,
            agent_public_key,
            pipeline_limit: DEFAULT_PIPELINE_LIMIT,
        }
    }
}

struct DaemonState {
    /// Outbound messages awaiting acknowledgement, keyed by their hash,
    /// in send order
    pipeline: IndexMap<String, CchMessage>,
    handshake_complete: bool,
    /// Most recent validated ack (SynAck or DataAck)
    last_ack: Option<CchMessage>,
    /// The Data message whose ack completed last; recovery pivots on it
    last_acked_data: Option<CchMessage>,
    recovering: bool,
    recovery_attempts: u32,
    agent_schema_version: Option<SchemaVersion>,
    /// Agents below schema 2.0 accept one message in flight and expect the
    /// base64/JSON-quoted payload transform
    pre_pipelining_agent: bool,
    /// The version string the agent negotiated in its SynAck, echoed on
    /// every outbound payload so predicted ack hashes match real ones
    negotiated_version: Option<String>,
    bzcert_hash: Option<String>,
    syn_action: Option<String>,
    first_synack_validated: bool,
}

impl DaemonState {
    fn negotiated(&self) -> &str {
        self.negotiated_version
            .as_deref()
            .unwrap_or(CCH_SCHEMA_VERSION)
    }
}

pub struct DaemonCch<P> {
    keypair: KeyPair,
    public_key: PublicKey,
    agent_public_key: PublicKey,
    provider: P,
    pipeline_limit: usize,

    state: Mutex<DaemonState>,
    pipeline_open: Notify,
    outbox_tx: mpsc::UnboundedSender<CchMessage>,
    outbox_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<CchMessage>>>,
    shutdown: CancellationToken,
}

impl<P: CertProvider> DaemonCch<P> {
    pub fn new(config: DaemonCchConfig, provider: P) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let public_key = config.keypair.public_key();
        Self {
            keypair: config.keypair,
            public_key,
            agent_public_key: config.agent_public_key,
            provider,
            pipeline_limit: config.pipeline_limit.max(1),
            state: Mutex::new(DaemonState {
                pipeline: IndexMap::new(),
                handshake_complete: false,
                last_ack: None,
                last_acked_data: None,
                recovering: false,
                recovery_attempts: 0,
                agent_schema_version: None,
                pre_pipelining_agent: false,
                negotiated_version: None,
                bzcert_hash: None,
                syn_action: None,
                first_synack_validated: false,
            }),
            pipeline_open: Notify::new(),
            outbox_tx,
            outbox_rx: std::sync::Mutex::new(Some(outbox_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Messages ready to transmit; the datachannel drains this to the
    /// transport. Can be taken once.
    pub fn take_outbox(&self) -> Option<mpsc::UnboundedReceiver<CchMessage>> {
        self.outbox_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Wake any blocked sender and refuse further work
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pipeline_open.notify_waiters();
    }

    pub async fn is_handshake_complete(&self) -> bool {
        self.state.lock().await.handshake_complete
    }

    /// Outstanding unacked messages
    pub async fn pipeline_len(&self) -> usize {
        self.state.lock().await.pipeline.len()
    }

    pub async fn is_recovering(&self) -> bool {
        self.state.lock().await.recovering
    }

    /// Open (or re-open) the session with a fresh Syn.
    ///
    /// The certificate is refreshed first; IdP failures propagate as-is so
    /// the caller can distinguish token problems from protocol ones.
    pub async fn open(&self, action: &str, payload: Vec<u8>) -> CchResult<()> {
        let cert = self.provider.refresh().await?;
        let mut state = self.state.lock().await;
        state.syn_action = Some(action.to_string());
        self.push_syn(&mut state, cert, action, payload)
    }

    /// Submit one plugin frame. Blocks until the handshake is complete and
    /// the pipeline has capacity, then builds, signs and queues the next
    /// Data message. FIFO order of callers is preserved by the datachannel
    /// driving this from a single task.
    pub async fn inbox(&self, action: &str, payload: Vec<u8>) -> CchResult<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(CchError::Shutdown);
            }

            // Register interest before re-checking the condition so a
            // broadcast between the check and the await is not lost.
            let notified = self.pipeline_open.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let limit = if state.pre_pipelining_agent {
                    1
                } else {
                    self.pipeline_limit
                };
                if state.handshake_complete && !state.recovering && state.pipeline.len() < limit {
                    return self.push_data(&mut state, action, payload, false);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => return Err(CchError::Shutdown),
            }
        }
    }

    /// Validate one inbound ack from the agent
    pub async fn validate(&self, message: &CchMessage) -> CchResult<()> {
        let mut state = self.state.lock().await;
        match &message.payload {
            CchPayload::SynAck(synack) => self.validate_synack(&mut state, message, synack),
            CchPayload::DataAck(_) => self.validate_dataack(&mut state, message),
            other => Err(CchError::UnexpectedMessage(other.tag())),
        }
    }

    fn validate_synack(
        &self,
        state: &mut DaemonState,
        message: &CchMessage,
        synack: &SynAckPayload,
    ) -> CchResult<()> {
        if message.verify(&self.agent_public_key).is_err() {
            // CWC-1553: legacy agents sign their first SynAck with the key
            // they embed as target_id rather than their registered identity.
            let fallback = PublicKey::new(synack.target_id.clone());
            if state.first_synack_validated || message.verify(&fallback).is_err() {
                return Err(CchError::InvalidSignature("synack"));
            }
        }

        let h_pointer = synack.h_pointer.clone();
        if !state.pipeline.contains_key(&h_pointer) {
            return Err(CchError::UnknownHPointer(h_pointer));
        }
        // The matched entry is the Syn; it leaves the window here.
        state.pipeline.shift_remove(&h_pointer);

        let parsed: SchemaVersion = synack.schema_version.parse()?;
        state.pre_pipelining_agent = parsed < SchemaVersion::new(2, 0, 0);
        state.negotiated_version = Some(synack.schema_version.clone());
        state.agent_schema_version = Some(parsed);
        state.first_synack_validated = true;
        state.last_ack = Some(message.clone());

        if state.recovering {
            self.resend(state, &synack.nonce)?;
            state.recovering = false;
        }

        state.handshake_complete = true;
        info!(
            agent_version = %synack.schema_version,
            pre_pipelining = state.pre_pipelining_agent,
            "handshake complete"
        );
        self.pipeline_open.notify_waiters();
        Ok(())
    }

    fn validate_dataack(&self, state: &mut DaemonState, message: &CchMessage) -> CchResult<()> {
        message
            .verify(&self.agent_public_key)
            .map_err(|_| CchError::InvalidSignature("dataack"))?;

        let h_pointer = message
            .payload
            .h_pointer()
            .unwrap_or_default()
            .to_string();
        if !state.pipeline.contains_key(&h_pointer) {
            return Err(CchError::UnknownHPointer(h_pointer));
        }

        // The chain is ordered, so an ack for message n also covers any
        // earlier entries whose acks were lost in transit.
        while let Some((first_hash, _)) = state.pipeline.first() {
            let first_hash = first_hash.clone();
            let Some((removed_hash, removed)) = state.pipeline.shift_remove_entry(&first_hash)
            else {
                break;
            };
            if removed_hash == h_pointer {
                state.last_acked_data = Some(removed);
                break;
            }
            debug!(hash = %removed_hash, "implicitly acked by later ack");
        }

        state.last_ack = Some(message.clone());
        state.recovery_attempts = 0;
        self.pipeline_open.notify_waiters();
        Ok(())
    }

    /// React to a peer error bound to an in-flight message. Returns whether
    /// a recovery exchange was started; irrelevant errors are ignored.
    pub async fn recover(&self, error: &ErrorMessage) -> CchResult<bool> {
        {
            let mut state = self.state.lock().await;
            if error.h_pointer.is_empty() {
                return Ok(false);
            }
            if state.recovering {
                return Ok(false);
            }
            if !state.pipeline.contains_key(&error.h_pointer) {
                return Ok(false);
            }

            state.recovery_attempts += 1;
            if state.recovery_attempts > MAX_ERROR_RECOVERY_TRIES {
                return Err(CchError::RecoveryExhausted(MAX_ERROR_RECOVERY_TRIES));
            }
            state.recovering = true;
            state.handshake_complete = false;
            warn!(
                attempt = state.recovery_attempts,
                error = %error.message,
                "starting error recovery"
            );
        }

        // Certificate refresh happens outside the lock.
        let cert = match self.provider.refresh().await {
            Ok(cert) => cert,
            Err(e) => {
                let mut state = self.state.lock().await;
                state.recovering = false;
                return Err(e.into());
            }
        };

        let mut state = self.state.lock().await;
        let action = state.syn_action.clone().unwrap_or_default();
        self.push_syn(&mut state, cert, &action, Vec::new())?;
        Ok(true)
    }

    fn push_syn(
        &self,
        state: &mut DaemonState,
        cert: BzCert,
        action: &str,
        payload: Vec<u8>,
    ) -> CchResult<()> {
        let cert_hash = cert.hash()?;
        let mut syn = CchMessage::new_unsigned(CchPayload::Syn(SynPayload {
            schema_version: CCH_SCHEMA_VERSION.to_string(),
            action: action.to_string(),
            action_payload: payload,
            target_id: self.agent_public_key.as_str().to_string(),
            nonce: random_nonce(),
            bz_cert: cert.clone(),
        }));
        syn.sign(&self.keypair).map_err(CchError::FailedToSign)?;

        // A superseded Syn (handshake retry) must not linger: the window
        // would never drain it and the next Data would chain to an ack the
        // agent will never produce.
        state
            .pipeline
            .retain(|_, message| matches!(message.payload, CchPayload::Data(_)));

        state.bzcert_hash = Some(cert_hash);
        state.handshake_complete = false;
        state.last_ack = None;
        state.pipeline.insert(syn.hash()?, syn.clone());
        let _ = self.outbox_tx.send(syn);
        Ok(())
    }

    /// Build, sign and queue the next Data under the lock. `resending`
    /// marks payloads that already went through the pre-pipelining
    /// transform on their first send.
    fn push_data(
        &self,
        state: &mut DaemonState,
        action: &str,
        payload: Vec<u8>,
        resending: bool,
    ) -> CchResult<()> {
        let parent_hash = match state.pipeline.last() {
            // More Data may be in flight than acks have returned; chain to
            // the ack the agent will deterministically produce.
            Some((_, newest)) => self.predicted_ack(state.negotiated(), newest)?.hash()?,
            None => match &state.last_ack {
                Some(ack) => ack.hash()?,
                None => return Err(CchError::UnexpectedMessage("data")),
            },
        };

        let action_payload = if state.pre_pipelining_agent && !resending {
            pre_pipelining_transform(&payload)?
        } else {
            payload
        };

        let mut data = CchMessage::new_unsigned(CchPayload::Data(DataPayload {
            schema_version: state.negotiated().to_string(),
            action: action.to_string(),
            action_payload,
            target_id: self.agent_public_key.as_str().to_string(),
            bz_cert_hash: state
                .bzcert_hash
                .clone()
                .ok_or(CchError::UnexpectedMessage("data"))?,
            h_pointer: parent_hash,
        }));
        data.sign(&self.keypair).map_err(CchError::FailedToSign)?;

        state.pipeline.insert(data.hash()?, data.clone());
        let _ = self.outbox_tx.send(data);
        Ok(())
    }

    /// The DataAck the agent will produce for `data`: same action, empty
    /// response payload, targeted back at this daemon. Never signed, never
    /// transmitted; it exists only to extend the local chain.
    fn predicted_ack(&self, version: &str, data: &CchMessage) -> CchResult<CchMessage> {
        Ok(CchMessage::new_unsigned(CchPayload::DataAck(
            DataAckPayload {
                schema_version: version.to_string(),
                action: data.payload.action().to_string(),
                action_response_payload: Vec::new(),
                target_id: self.public_key.as_str().to_string(),
                h_pointer: data.hash()?,
            },
        )))
    }

    /// After a recovery SynAck, re-emit the outstanding messages the agent
    /// never processed, rebuilt against the new chain head.
    fn resend(&self, state: &mut DaemonState, recovery_nonce: &str) -> CchResult<()> {
        let snapshot: Vec<CchMessage> = state.pipeline.values().cloned().collect();
        state.pipeline.clear();

        let nonce_reliable = state
            .agent_schema_version
            .as_ref()
            .map(|v| *v > SchemaVersion::new(2, 0, 0))
            .unwrap_or(false);

        let start = if !nonce_reliable {
            // Old agents may answer with a nonce that references nothing;
            // the only safe choice is to replay everything outstanding.
            0
        } else if state
            .last_acked_data
            .as_ref()
            .map(|data| data.hash())
            .transpose()?
            .as_deref()
            == Some(recovery_nonce)
        {
            // Agent and daemon agree on the last acked Data; everything
            // still in the snapshot came after it.
            0
        } else if let Some(position) = snapshot
            .iter()
            .position(|message| message.hash().ok().as_deref() == Some(recovery_nonce))
        {
            // The agent acked further than we saw; messages up to and
            // including the referenced one are settled.
            state.last_acked_data = Some(snapshot[position].clone());
            position + 1
        } else {
            // Unknown nonce from a current agent: resend nothing rather
            // than replay messages the agent may already have applied.
            warn!("recovery nonce references no outstanding message; resending nothing");
            snapshot.len()
        };

        for message in &snapshot[start..] {
            if let CchPayload::Data(data) = &message.payload {
                self.push_data(state, &data.action, data.action_payload.clone(), true)?;
            }
        }
        debug!(
            resent = snapshot.len().saturating_sub(start),
            dropped = start,
            "pipeline resent after recovery"
        );
        Ok(())
    }
}

/// Agents below schema 2.0 expect Data payloads base64-encoded and
/// JSON-quoted rather than raw bytes.
fn pre_pipelining_transform(payload: &[u8]) -> CchResult<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    Ok(serde_json::to_vec(&BASE64.encode(payload))
        .map_err(bolthole_crypto::CryptoError::from)?)
}
