//! Agent-side CCH engine
//!
//! Validates inbound Syn and Data messages against the session's
//! certificate, signature, target and hash chain, and builds the signed
//! acks that advance the chain head.
//!
//! Agent acks are deterministic given the message they acknowledge: a
//! DataAck carries the inbound action and an empty response payload. The
//! daemon relies on this to predict ack hashes for pipelined sends; bulk
//! responses travel as Stream messages instead.

use chrono::{DateTime, Utc};
use tracing::debug;

use bolthole_crypto::{random_nonce, KeyPair, PublicKey};
use bolthole_types::{
    BzCert, CchMessage, CchPayload, DataAckPayload, DataPayload, SchemaVersion, SynAckPayload,
    SynPayload,
};

use crate::{CchError, CchResult, CertVerify, CCH_SCHEMA_VERSION};

pub struct AgentCch<V> {
    keypair: KeyPair,
    public_key: PublicKey,
    verifier: V,

    expected_h_pointer: Option<String>,
    last_data: Option<CchMessage>,

    client_cert: Option<BzCert>,
    client_cert_hash: Option<String>,
    client_public_key: Option<PublicKey>,
    cert_expiry: Option<DateTime<Utc>>,

    daemon_schema_version: Option<SchemaVersion>,
    negotiated_version: String,
}

impl<V: CertVerify> AgentCch<V> {
    pub fn new(keypair: KeyPair, verifier: V) -> Self {
        let public_key = keypair.public_key();
        Self {
            keypair,
            public_key,
            verifier,
            expected_h_pointer: None,
            last_data: None,
            client_cert: None,
            client_cert_hash: None,
            client_public_key: None,
            cert_expiry: None,
            daemon_schema_version: None,
            negotiated_version: CCH_SCHEMA_VERSION.to_string(),
        }
    }

    /// The version both sides agreed on at handshake
    pub fn negotiated_version(&self) -> &str {
        &self.negotiated_version
    }

    /// This agent's public key, the required `target_id` of inbound
    /// messages on schema > 1.0
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn client_public_key(&self) -> Option<&PublicKey> {
        self.client_public_key.as_ref()
    }

    /// The certificate the session is bound to, once a Syn has validated
    pub fn client_cert(&self) -> Option<&BzCert> {
        self.client_cert.as_ref()
    }

    /// Validate one inbound message; the datachannel decides what a
    /// rejection means for the session.
    pub async fn validate(&mut self, message: &CchMessage) -> CchResult<()> {
        match &message.payload {
            CchPayload::Syn(syn) => self.validate_syn(message, syn).await,
            CchPayload::Data(data) => self.validate_data(message, data),
            other => Err(CchError::UnexpectedMessage(other.tag())),
        }
    }

    async fn validate_syn(&mut self, message: &CchMessage, syn: &SynPayload) -> CchResult<()> {
        let expiry = self.verifier.verify(&syn.bz_cert).await?;

        let client_key = syn.bz_cert.public_key();
        message
            .verify(&client_key)
            .map_err(|_| CchError::InvalidSignature("syn"))?;

        let version: SchemaVersion = syn.schema_version.parse()?;
        if version > SchemaVersion::new(1, 0, 0) && syn.target_id != self.public_key.as_str() {
            return Err(CchError::TargetMismatch {
                expected: self.public_key.as_str().to_string(),
                received: syn.target_id.clone(),
            });
        }

        // Negotiated = min(agent, daemon); carry the daemon's exact string
        // when it wins so both sides hash identical ack payloads.
        self.negotiated_version = if version < SchemaVersion::new(2, 1, 0) {
            syn.schema_version.clone()
        } else {
            CCH_SCHEMA_VERSION.to_string()
        };
        debug!(daemon_version = %syn.schema_version, negotiated = %self.negotiated_version, "validated syn");

        self.daemon_schema_version = Some(version);
        self.client_cert_hash = Some(syn.bz_cert.hash()?);
        self.client_cert = Some(syn.bz_cert.clone());
        self.client_public_key = Some(client_key);
        self.cert_expiry = Some(expiry);
        Ok(())
    }

    fn validate_data(&mut self, message: &CchMessage, data: &DataPayload) -> CchResult<()> {
        let cert_hash = self
            .client_cert_hash
            .as_deref()
            .ok_or(CchError::UnexpectedMessage("data"))?;
        if data.bz_cert_hash != cert_hash {
            return Err(CchError::CertHashMismatch);
        }

        let client_key = self
            .client_public_key
            .as_ref()
            .ok_or(CchError::UnexpectedMessage("data"))?;
        message
            .verify(client_key)
            .map_err(|_| CchError::InvalidSignature("data"))?;

        if let Some(expiry) = self.cert_expiry {
            if expiry <= Utc::now() {
                return Err(CchError::CertExpired(expiry));
            }
        }

        if let Some(version) = &self.daemon_schema_version {
            if *version > SchemaVersion::new(1, 0, 0)
                && data.target_id != self.public_key.as_str()
            {
                return Err(CchError::TargetMismatch {
                    expected: self.public_key.as_str().to_string(),
                    received: data.target_id.clone(),
                });
            }
        }

        let expected = self.expected_h_pointer.clone().unwrap_or_default();
        if data.h_pointer != expected {
            return Err(CchError::ChainMismatch {
                expected,
                received: data.h_pointer.clone(),
            });
        }

        self.last_data = Some(message.clone());
        Ok(())
    }

    /// Build and sign the ack for a validated message, advancing the
    /// expected chain head to the ack's own hash.
    pub fn build_ack(
        &mut self,
        inbound: &CchMessage,
        action: &str,
        payload: Vec<u8>,
    ) -> CchResult<CchMessage> {
        let client_key = self
            .client_public_key
            .as_ref()
            .ok_or(CchError::UnexpectedMessage("ack"))?;

        let ack_payload = match &inbound.payload {
            CchPayload::Syn(_) => {
                // First SynAck of a session carries a random nonce; a
                // recovery SynAck instead names the last Data this agent
                // acked, so the daemon can find the common chain point.
                let nonce = match &self.last_data {
                    Some(data) => data.hash()?,
                    None => random_nonce(),
                };
                CchPayload::SynAck(SynAckPayload {
                    schema_version: self.negotiated_version.clone(),
                    action: action.to_string(),
                    action_response_payload: payload,
                    target_id: client_key.as_str().to_string(),
                    nonce,
                    h_pointer: inbound.hash()?,
                })
            }
            CchPayload::Data(_) => CchPayload::DataAck(DataAckPayload {
                schema_version: self.negotiated_version.clone(),
                action: action.to_string(),
                action_response_payload: payload,
                target_id: client_key.as_str().to_string(),
                h_pointer: inbound.hash()?,
            }),
            other => return Err(CchError::UnexpectedMessage(other.tag())),
        };

        let mut ack = CchMessage::new_unsigned(ack_payload);
        ack.sign(&self.keypair).map_err(CchError::FailedToSign)?;
        self.expected_h_pointer = Some(ack.hash()?);
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{signed_syn, test_cert, TrustingVerifier};

    fn engine() -> AgentCch<TrustingVerifier> {
        AgentCch::new(KeyPair::generate(), TrustingVerifier::valid())
    }

    #[tokio::test]
    async fn test_syn_with_wrong_target_is_rejected() {
        let mut agent = engine();
        let (cert, daemon_keys) = test_cert();
        let syn = signed_syn(&daemon_keys, &cert, "wrong-target", "2.1");

        assert!(matches!(
            agent.validate(&syn).await,
            Err(CchError::TargetMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_old_schema_skips_target_check() {
        let mut agent = engine();
        let (cert, daemon_keys) = test_cert();
        let syn = signed_syn(&daemon_keys, &cert, "wrong-target", "1.0");

        agent.validate(&syn).await.unwrap();
        assert_eq!(agent.negotiated_version(), "1.0");
    }

    #[tokio::test]
    async fn test_syn_signed_by_stranger_is_rejected() {
        let mut agent = engine();
        let (cert, _) = test_cert();
        let stranger = KeyPair::generate();
        let syn = signed_syn(&stranger, &cert, agent.public_key.as_str(), "2.1");

        assert!(matches!(
            agent.validate(&syn).await,
            Err(CchError::InvalidSignature("syn"))
        ));
    }

    #[tokio::test]
    async fn test_first_synack_nonce_is_random_then_chained() {
        let mut agent = engine();
        let (cert, daemon_keys) = test_cert();
        let syn = signed_syn(&daemon_keys, &cert, agent.public_key.as_str(), "2.1");
        agent.validate(&syn).await.unwrap();

        let synack = agent.build_ack(&syn, "shell/open", Vec::new()).unwrap();
        let first_nonce = synack.payload.nonce().unwrap().to_string();

        // Deliver one chained Data, then a recovery Syn: its SynAck nonce
        // must equal the validated Data's hash.
        let mut data = CchMessage::new_unsigned(CchPayload::Data(DataPayload {
            schema_version: "2.1".to_string(),
            action: "shell/input".to_string(),
            action_payload: b"whoami".to_vec(),
            target_id: agent.public_key.as_str().to_string(),
            bz_cert_hash: cert.hash().unwrap(),
            h_pointer: synack.hash().unwrap(),
        }));
        data.sign(&daemon_keys).unwrap();
        agent.validate(&data).await.unwrap();
        agent
            .build_ack(&data, "shell/input", Vec::new())
            .unwrap();

        let recovery_syn = signed_syn(&daemon_keys, &cert, agent.public_key.as_str(), "2.1");
        agent.validate(&recovery_syn).await.unwrap();
        let recovery_ack = agent
            .build_ack(&recovery_syn, "shell/open", Vec::new())
            .unwrap();

        assert_ne!(first_nonce, recovery_ack.payload.nonce().unwrap());
        assert_eq!(
            recovery_ack.payload.nonce().unwrap(),
            data.hash().unwrap()
        );
    }

    #[tokio::test]
    async fn test_data_with_broken_chain_is_rejected() {
        let mut agent = engine();
        let (cert, daemon_keys) = test_cert();
        let syn = signed_syn(&daemon_keys, &cert, agent.public_key.as_str(), "2.1");
        agent.validate(&syn).await.unwrap();
        agent.build_ack(&syn, "shell/open", Vec::new()).unwrap();

        let mut data = CchMessage::new_unsigned(CchPayload::Data(DataPayload {
            schema_version: "2.1".to_string(),
            action: "shell/input".to_string(),
            action_payload: b"whoami".to_vec(),
            target_id: agent.public_key.as_str().to_string(),
            bz_cert_hash: cert.hash().unwrap(),
            h_pointer: "not-the-synack-hash".to_string(),
        }));
        data.sign(&daemon_keys).unwrap();

        assert!(matches!(
            agent.validate(&data).await,
            Err(CchError::ChainMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_data_bound_to_another_cert_is_rejected() {
        let mut agent = engine();
        let (cert, daemon_keys) = test_cert();
        let syn = signed_syn(&daemon_keys, &cert, agent.public_key.as_str(), "2.1");
        agent.validate(&syn).await.unwrap();
        let synack = agent.build_ack(&syn, "shell/open", Vec::new()).unwrap();

        let (other_cert, _) = test_cert();
        let mut data = CchMessage::new_unsigned(CchPayload::Data(DataPayload {
            schema_version: "2.1".to_string(),
            action: "shell/input".to_string(),
            action_payload: b"whoami".to_vec(),
            target_id: agent.public_key.as_str().to_string(),
            bz_cert_hash: other_cert.hash().unwrap(),
            h_pointer: synack.hash().unwrap(),
        }));
        data.sign(&daemon_keys).unwrap();

        assert!(matches!(
            agent.validate(&data).await,
            Err(CchError::CertHashMismatch)
        ));
    }

    #[tokio::test]
    async fn test_data_with_expired_cert_is_rejected() {
        let mut agent = AgentCch::new(KeyPair::generate(), TrustingVerifier::expired());
        let (cert, daemon_keys) = test_cert();
        let syn = signed_syn(&daemon_keys, &cert, agent.public_key.as_str(), "2.1");
        agent.validate(&syn).await.unwrap();
        let synack = agent.build_ack(&syn, "shell/open", Vec::new()).unwrap();

        let mut data = CchMessage::new_unsigned(CchPayload::Data(DataPayload {
            schema_version: "2.1".to_string(),
            action: "shell/input".to_string(),
            action_payload: b"whoami".to_vec(),
            target_id: agent.public_key.as_str().to_string(),
            bz_cert_hash: cert.hash().unwrap(),
            h_pointer: synack.hash().unwrap(),
        }));
        data.sign(&daemon_keys).unwrap();

        assert!(matches!(
            agent.validate(&data).await,
            Err(CchError::CertExpired(_))
        ));
    }
}
