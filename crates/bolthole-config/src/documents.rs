//! The persisted document types and their on-disk history
//!
//! Writes always emit JSON (V2). Reads also accept the V1 binary payload
//! that early agents wrote; migration carries every field verbatim except
//! `ShutdownState`, which changed from a flat string to a map and is
//! dropped.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ConfigDoc;

/// The agent's persisted identity and lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AgentConfig {
    pub version: String,
    pub public_key: String,
    pub private_key: String,
    pub agent_identity_token: String,
    pub target_id: String,
    pub idp_provider: String,
    pub idp_org_id: String,
    pub service_url: String,
    pub shutdown_reason: String,
    pub shutdown_state: HashMap<String, String>,
    pub jwks_url_patterns: Vec<String>,
}

impl ConfigDoc for AgentConfig {
    const FILE_NAME: &'static str = "vault.json";
    const SECRET_DATA_KEY: &'static str = "secret";

    fn secret_name(target_name: &str) -> String {
        format!("bctl-{target_name}-secret")
    }

    fn is_registered(&self) -> bool {
        !self.public_key.is_empty()
    }

    fn from_legacy_bytes(bytes: &[u8]) -> Option<Self> {
        let v1: AgentConfigV1 = bincode::deserialize(bytes).ok()?;
        Some(v1.into())
    }
}

/// V1 binary payload; `shutdown_state` was a flat string
#[derive(Debug, Serialize, Deserialize)]
struct AgentConfigV1 {
    version: String,
    public_key: String,
    private_key: String,
    agent_identity_token: String,
    target_id: String,
    idp_provider: String,
    idp_org_id: String,
    service_url: String,
    shutdown_reason: String,
    #[allow(dead_code)]
    shutdown_state: String,
}

impl From<AgentConfigV1> for AgentConfig {
    fn from(v1: AgentConfigV1) -> Self {
        AgentConfig {
            version: v1.version,
            public_key: v1.public_key,
            private_key: v1.private_key,
            agent_identity_token: v1.agent_identity_token,
            target_id: v1.target_id,
            idp_provider: v1.idp_provider,
            idp_org_id: v1.idp_org_id,
            service_url: v1.service_url,
            shutdown_reason: v1.shutdown_reason,
            // The V1 string form has no map equivalent; it starts over.
            shutdown_state: HashMap::new(),
            jwks_url_patterns: Vec::new(),
        }
    }
}

/// One split-key record for database SplitCert authentication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct KeyShardEntry {
    pub key_shard_pem: String,
    pub ca_cert_pem: String,
    pub target_ids: Vec<String>,
}

/// The per-target key-shard store, orthogonal to agent identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct KeyShardConfig {
    pub shards: Vec<KeyShardEntry>,
}

impl KeyShardConfig {
    /// The shard holding a key for the given target, if any
    pub fn shard_for(&self, target_id: &str) -> Option<&KeyShardEntry> {
        self.shards
            .iter()
            .find(|shard| shard.target_ids.iter().any(|id| id == target_id))
    }
}

impl ConfigDoc for KeyShardConfig {
    const FILE_NAME: &'static str = "keyshards.json";
    const SECRET_DATA_KEY: &'static str = "keyshards";

    fn secret_name(target_name: &str) -> String {
        format!("bctl-{target_name}-keyshards-secret")
    }

    fn is_registered(&self) -> bool {
        true
    }
}
