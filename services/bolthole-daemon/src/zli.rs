//! Workstation (ZLI) configuration
//!
//! The login flow writes this file: the daemon's key pair plus the
//! workstation certificate whose id tokens it keeps refreshed. The daemon
//! re-reads the file before every Syn so a refreshed token is picked up
//! without restarting.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use bolthole_bzcert::BzCertError;
use bolthole_cch::CertProvider;
use bolthole_crypto::{CryptoError, KeyPair};
use bolthole_types::BzCert;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZliConfig {
    pub public_key: String,
    pub private_key: String,
    pub cert: BzCert,
}

#[derive(Debug, thiserror::Error)]
pub enum ZliConfigError {
    #[error("cannot read workstation config {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workstation config {path} is malformed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("workstation key pair is invalid: {0}")]
    BadKeyPair(#[from] CryptoError),
}

pub fn load(path: &PathBuf) -> Result<ZliConfig, ZliConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ZliConfigError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ZliConfigError::Malformed {
        path: path.display().to_string(),
        source,
    })
}

pub fn keypair(config: &ZliConfig) -> Result<KeyPair, ZliConfigError> {
    Ok(KeyPair::from_base64(&config.private_key)?)
}

/// Refreshes the certificate by re-reading the workstation config
pub struct ZliCertProvider {
    path: PathBuf,
}

impl ZliCertProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CertProvider for ZliCertProvider {
    async fn refresh(&self) -> Result<BzCert, BzCertError> {
        let config = load(&self.path).map_err(|e| BzCertError::CertConfig(e.to_string()))?;
        Ok(config.cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_unreadable() {
        let path = PathBuf::from("/definitely/not/here.json");
        assert!(matches!(
            load(&path),
            Err(ZliConfigError::Unreadable { .. })
        ));
    }
}
