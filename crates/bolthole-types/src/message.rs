//! The CCH message model
//!
//! A CCH message is a closed union of four variants (Syn, SynAck, Data,
//! DataAck) carried in an envelope with an Ed25519 signature over the
//! canonical hash of the payload. The envelope serialises the payload twice:
//! under the modern `payload` field and under the legacy alias
//! `keysplittingPayload`, so that either side of an old/new pairing can
//! decode it. Decode takes `payload` when present and falls back to the
//! alias; unknown `type` tags are rejected.

use serde::de::Error as DeError;
use serde::ser::{Error as SerError, SerializeStruct};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use bolthole_crypto::{canonical_hash, canonical_digest, CryptoResult, KeyPair, PublicKey};

use crate::base64_bytes;
use crate::cert::BzCert;

/// Opens a session: carries the certificate and a fresh nonce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynPayload {
    pub schema_version: String,
    pub action: String,
    #[serde(with = "base64_bytes")]
    pub action_payload: Vec<u8>,
    pub target_id: String,
    pub nonce: String,
    pub bz_cert: BzCert,
}

/// Completes the handshake; `nonce` is random on a first SynAck and the
/// hash of the last acked Data on a recovery SynAck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynAckPayload {
    pub schema_version: String,
    pub action: String,
    #[serde(with = "base64_bytes")]
    pub action_response_payload: Vec<u8>,
    pub target_id: String,
    pub nonce: String,
    pub h_pointer: String,
}

/// An ordered, certificate-bound request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    pub schema_version: String,
    pub action: String,
    #[serde(with = "base64_bytes")]
    pub action_payload: Vec<u8>,
    pub target_id: String,
    pub bz_cert_hash: String,
    pub h_pointer: String,
}

/// Acknowledges one Data message by its hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataAckPayload {
    pub schema_version: String,
    pub action: String,
    #[serde(with = "base64_bytes")]
    pub action_response_payload: Vec<u8>,
    pub target_id: String,
    pub h_pointer: String,
}

/// The four CCH message variants
#[derive(Debug, Clone, PartialEq)]
pub enum CchPayload {
    Syn(SynPayload),
    SynAck(SynAckPayload),
    Data(DataPayload),
    DataAck(DataAckPayload),
}

const TAG_SYN: &str = "syn";
const TAG_SYN_ACK: &str = "synack";
const TAG_DATA: &str = "data";
const TAG_DATA_ACK: &str = "dataack";

impl CchPayload {
    pub fn tag(&self) -> &'static str {
        match self {
            CchPayload::Syn(_) => TAG_SYN,
            CchPayload::SynAck(_) => TAG_SYN_ACK,
            CchPayload::Data(_) => TAG_DATA,
            CchPayload::DataAck(_) => TAG_DATA_ACK,
        }
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            CchPayload::Syn(p) => serde_json::to_value(p),
            CchPayload::SynAck(p) => serde_json::to_value(p),
            CchPayload::Data(p) => serde_json::to_value(p),
            CchPayload::DataAck(p) => serde_json::to_value(p),
        }
    }

    pub fn schema_version(&self) -> &str {
        match self {
            CchPayload::Syn(p) => &p.schema_version,
            CchPayload::SynAck(p) => &p.schema_version,
            CchPayload::Data(p) => &p.schema_version,
            CchPayload::DataAck(p) => &p.schema_version,
        }
    }

    pub fn action(&self) -> &str {
        match self {
            CchPayload::Syn(p) => &p.action,
            CchPayload::SynAck(p) => &p.action,
            CchPayload::Data(p) => &p.action,
            CchPayload::DataAck(p) => &p.action,
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            CchPayload::Syn(p) => &p.target_id,
            CchPayload::SynAck(p) => &p.target_id,
            CchPayload::Data(p) => &p.target_id,
            CchPayload::DataAck(p) => &p.target_id,
        }
    }

    /// The hash-chain pointer, absent on Syn
    pub fn h_pointer(&self) -> Option<&str> {
        match self {
            CchPayload::Syn(_) => None,
            CchPayload::SynAck(p) => Some(&p.h_pointer),
            CchPayload::Data(p) => Some(&p.h_pointer),
            CchPayload::DataAck(p) => Some(&p.h_pointer),
        }
    }

    pub fn nonce(&self) -> Option<&str> {
        match self {
            CchPayload::Syn(p) => Some(&p.nonce),
            CchPayload::SynAck(p) => Some(&p.nonce),
            _ => None,
        }
    }
}

/// A signed CCH message
#[derive(Debug, Clone, PartialEq)]
pub struct CchMessage {
    pub payload: CchPayload,
    /// Base64 Ed25519 signature over the canonical payload digest; empty on
    /// predicted (never transmitted) acks
    pub signature: String,
}

impl CchMessage {
    pub fn new_unsigned(payload: CchPayload) -> Self {
        Self {
            payload,
            signature: String::new(),
        }
    }

    /// The object whose canonical form is hashed and signed: the payload
    /// bound to its variant tag
    fn hashable(&self) -> serde_json::Result<Value> {
        Ok(serde_json::json!({
            "type": self.payload.tag(),
            "payload": self.payload.to_value()?,
        }))
    }

    /// Canonical hash of this message, used as the peer's next `h_pointer`
    pub fn hash(&self) -> CryptoResult<String> {
        canonical_hash(&self.hashable()?)
    }

    /// Sign the payload digest with the sender's key
    pub fn sign(&mut self, keypair: &KeyPair) -> CryptoResult<()> {
        let digest = canonical_digest(&self.hashable()?)?;
        self.signature = keypair.sign(&digest)?;
        Ok(())
    }

    /// Verify the signature under the sender's public key
    pub fn verify(&self, public_key: &PublicKey) -> CryptoResult<()> {
        let digest = canonical_digest(&self.hashable()?)?;
        public_key.verify(&digest, &self.signature)
    }
}

impl Serialize for CchMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = self.payload.to_value().map_err(S::Error::custom)?;
        let mut envelope = serializer.serialize_struct("CchMessage", 4)?;
        envelope.serialize_field("type", self.payload.tag())?;
        envelope.serialize_field("payload", &payload)?;
        envelope.serialize_field("keysplittingPayload", &payload)?;
        envelope.serialize_field("signature", &self.signature)?;
        envelope.end()
    }
}

impl<'de> Deserialize<'de> for CchMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            message_type: String,
            payload: Option<Value>,
            #[serde(rename = "keysplittingPayload")]
            keysplitting_payload: Option<Value>,
            #[serde(default)]
            signature: String,
        }

        let envelope = Envelope::deserialize(deserializer)?;
        let value = envelope
            .payload
            .or(envelope.keysplitting_payload)
            .ok_or_else(|| D::Error::missing_field("payload"))?;

        let payload = match envelope.message_type.as_str() {
            TAG_SYN => CchPayload::Syn(serde_json::from_value(value).map_err(D::Error::custom)?),
            TAG_SYN_ACK => {
                CchPayload::SynAck(serde_json::from_value(value).map_err(D::Error::custom)?)
            }
            TAG_DATA => CchPayload::Data(serde_json::from_value(value).map_err(D::Error::custom)?),
            TAG_DATA_ACK => {
                CchPayload::DataAck(serde_json::from_value(value).map_err(D::Error::custom)?)
            }
            other => {
                return Err(D::Error::unknown_variant(
                    other,
                    &[TAG_SYN, TAG_SYN_ACK, TAG_DATA, TAG_DATA_ACK],
                ))
            }
        };

        Ok(CchMessage {
            payload,
            signature: envelope.signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> CchMessage {
        CchMessage::new_unsigned(CchPayload::Data(DataPayload {
            schema_version: "2.1".to_string(),
            action: "shell/input".to_string(),
            action_payload: b"ls -la".to_vec(),
            target_id: "agent-key".to_string(),
            bz_cert_hash: "cert-hash".to_string(),
            h_pointer: "previous-hash".to_string(),
        }))
    }

    #[test]
    fn test_envelope_carries_both_payload_fields() {
        let encoded = serde_json::to_value(sample_data()).unwrap();
        assert_eq!(encoded["type"], "data");
        assert_eq!(encoded["payload"], encoded["keysplittingPayload"]);
        assert_eq!(encoded["payload"]["action"], "shell/input");
    }

    #[test]
    fn test_decode_prefers_modern_field() {
        let mut encoded = serde_json::to_value(sample_data()).unwrap();
        encoded["keysplittingPayload"]["action"] = "stale".into();
        let decoded: CchMessage = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.payload.action(), "shell/input");
    }

    #[test]
    fn test_decode_accepts_legacy_field_alone() {
        let mut encoded = serde_json::to_value(sample_data()).unwrap();
        encoded.as_object_mut().unwrap().remove("payload");
        let decoded: CchMessage = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, sample_data());
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut encoded = serde_json::to_value(sample_data()).unwrap();
        encoded["type"] = "finack".into();
        assert!(serde_json::from_value::<CchMessage>(encoded).is_err());
    }

    #[test]
    fn test_round_trip() {
        let message = sample_data();
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: CchMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_hash_ignores_signature() {
        let mut message = sample_data();
        let unsigned_hash = message.hash().unwrap();
        message.sign(&bolthole_crypto::KeyPair::generate()).unwrap();
        assert_eq!(message.hash().unwrap(), unsigned_hash);
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = bolthole_crypto::KeyPair::generate();
        let mut message = sample_data();
        message.sign(&keypair).unwrap();
        message.verify(&keypair.public_key()).unwrap();

        let stranger = bolthole_crypto::KeyPair::generate();
        assert!(message.verify(&stranger.public_key()).is_err());
    }

    #[test]
    fn test_action_payload_travels_as_base64() {
        let encoded = serde_json::to_value(sample_data()).unwrap();
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        assert_eq!(
            encoded["payload"]["actionPayload"],
            BASE64.encode(b"ls -la")
        );
    }
}
