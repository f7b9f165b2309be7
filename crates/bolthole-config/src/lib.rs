//! Bolthole Config - persistent agent state
//!
//! Two backends share one contract: a lock-file-guarded JSON file on
//! plain hosts, and a namespaced Secret in Kubernetes. Both enforce
//! single-writer optimistic concurrency - a save whose baseline (file
//! mtime / secret resourceVersion) is stale fails with
//! [`ConfigError::ChangedSinceFetch`] and the caller must refetch.
//!
//! Two document types coexist per target: the agent's own identity
//! ([`AgentConfig`]) and the key-shard store ([`KeyShardConfig`]).

pub mod cluster;
pub mod documents;
pub mod file;

pub use cluster::ClusterBackend;
pub use documents::{AgentConfig, KeyShardConfig, KeyShardEntry};
pub use file::FileBackend;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The caller's baseline is stale; refetch and retry
    #[error("config changed since fetch")]
    ChangedSinceFetch,

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("config serialisation failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("kubernetes api failure: {0}")]
    Kube(#[from] kube::Error),

    #[error("filesystem watch failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("wait for registration cancelled")]
    Cancelled,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// One persistable config document
pub trait ConfigDoc:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    /// File name under the config directory
    const FILE_NAME: &'static str;

    /// Data key inside the backing Secret
    const SECRET_DATA_KEY: &'static str;

    /// Name of the per-target Secret
    fn secret_name(target_name: &str) -> String;

    /// Registration is complete once this holds
    fn is_registered(&self) -> bool;

    /// Decode a pre-JSON on-disk payload, if this document ever had one
    fn from_legacy_bytes(_bytes: &[u8]) -> Option<Self> {
        None
    }
}

/// The store contract shared by both backends
#[async_trait]
pub trait ConfigBackend<T: ConfigDoc>: Send + Sync {
    /// Read the whole document and record the concurrency baseline
    async fn fetch(&mut self) -> ConfigResult<T>;

    /// Write the whole document; fails if the store changed since the
    /// last fetch
    async fn save(&mut self, document: &T) -> ConfigResult<()>;

    /// Block until a write makes the document registered
    async fn wait_for_registration(&mut self, cancel: &CancellationToken) -> ConfigResult<T>;
}
