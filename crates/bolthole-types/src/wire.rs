//! The transport envelope and control payloads
//!
//! The transport delivers framed JSON messages routed by channel id. Every
//! frame is an [`AgentMessage`]; the `message_type` selects how the opaque
//! payload is interpreted. The CCH envelope travels under the legacy wire
//! name `keysplitting`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::base64_bytes;

/// Schema version of the transport envelope itself
pub const WIRE_SCHEMA_VERSION: &str = "1.1";

/// One framed message on the shared transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub channel_id: String,
    pub message_type: MessageType,
    pub schema_version: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl AgentMessage {
    /// Frame a serialisable payload for a channel
    pub fn wrap<T: Serialize>(
        channel_id: &str,
        message_type: MessageType,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            channel_id: channel_id.to_string(),
            message_type,
            schema_version: WIRE_SCHEMA_VERSION.to_string(),
            payload: serde_json::to_vec(payload)?,
        })
    }

    /// Parse the opaque payload as a typed value
    pub fn parse<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Wire message types used on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// The CCH envelope; wire name kept from the protocol's previous life
    #[serde(rename = "keysplitting")]
    Keysplitting,
    /// Plugin bulk data
    #[serde(rename = "stream")]
    Stream,
    /// Peer-signalled error
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "openDataChannel")]
    OpenDataChannel,
    #[serde(rename = "closeDataChannel")]
    CloseDataChannel,
    /// Control-channel heartbeat
    #[serde(rename = "pong")]
    Pong,
    /// Bastion-requested agent restart
    #[serde(rename = "restart")]
    Restart,
}

/// A peer-signalled error bound to a point in the hash chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub schema_version: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub h_pointer: String,
}

/// Request to open a plugin datachannel, received on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDataChannelPayload {
    pub channel_id: String,
    pub action: String,
}

/// Explicit close notification for one datachannel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseDataChannelPayload {
    pub reason: String,
}

/// Plugin bulk data riding outside the CCH chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub stream_type: String,
    pub sequence_number: u64,
    pub more: bool,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// Control-channel heartbeat payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub target_id: String,
    pub timestamp: i64,
}

/// Error strings matched by substring across the wire. These mirror the
/// peer's wording exactly; changing them breaks cross-version pairings.
pub const USER_NOT_FOUND_ERR_MSG: &str = "UserNotFoundError";
pub const POLICY_EDITED_ERR_MSG: &str = "PolicyEditedConnectionClosedError";
pub const POLICY_DELETED_ERR_MSG: &str = "PolicyDeletedConnectionClosedError";
pub const IDLE_TIMEOUT_ERR_MSG: &str = "IdleTimeoutConnectionClosedError";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_and_parse() {
        let inner = ErrorMessage {
            schema_version: "2.1".to_string(),
            error_type: "ChainMismatch".to_string(),
            message: "hash chain mismatch".to_string(),
            h_pointer: "abc".to_string(),
        };
        let framed = AgentMessage::wrap("channel-1", MessageType::Error, &inner).unwrap();
        assert_eq!(framed.channel_id, "channel-1");
        assert_eq!(framed.parse::<ErrorMessage>().unwrap(), inner);
    }

    #[test]
    fn test_message_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::Keysplitting).unwrap(),
            "\"keysplitting\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::OpenDataChannel).unwrap(),
            "\"openDataChannel\""
        );
    }

    #[test]
    fn test_error_message_uses_type_field() {
        let raw = r#"{"schemaVersion":"2.0","type":"Unknown","message":"m","hPointer":""}"#;
        let parsed: ErrorMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.error_type, "Unknown");
    }
}
