//! Workstation certificate data model
//!
//! A BZCert is the daemon's compound identity: its Ed25519 public key, a
//! signed random nonce, and one or two IdP id tokens binding the key to a
//! human or service account. Verification lives in `bolthole-bzcert`; this
//! module only carries the shape and the two derived values every other
//! component needs (the canonical hash and the auth nonce).

use serde::{Deserialize, Serialize};

use bolthole_crypto::{canonical_hash, sha3_base64, sha3_digest, CryptoResult, PublicKey};

/// The workstation certificate embedded in every Syn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BzCert {
    /// Daemon's Ed25519 public key (base64)
    pub client_public_key: String,
    /// Base64 nonce chosen at certificate creation
    pub rand: String,
    /// Signature by `client_public_key` over SHA3-256 of the decoded nonce
    pub signature_on_rand: String,
    /// IdP id token issued once at certificate creation
    pub initial_id_token: String,
    /// Refreshable IdP id token; equals `initial_id_token` for service accounts
    pub current_id_token: String,
}

impl BzCert {
    /// Canonical hash binding Data messages to this certificate
    pub fn hash(&self) -> CryptoResult<String> {
        canonical_hash(self)
    }

    /// The nonce expected in the initial id token's `nonce` claim:
    /// base64(SHA3-256(client_public_key || signature_on_rand || rand))
    pub fn auth_nonce(&self) -> String {
        let mut concatenated =
            String::with_capacity(self.client_public_key.len() + self.signature_on_rand.len() + self.rand.len());
        concatenated.push_str(&self.client_public_key);
        concatenated.push_str(&self.signature_on_rand);
        concatenated.push_str(&self.rand);
        sha3_base64(concatenated.as_bytes())
    }

    /// The daemon's public key in its typed form
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.client_public_key.clone())
    }

    /// The digest `signature_on_rand` must verify against
    pub fn rand_digest(&self) -> CryptoResult<[u8; 32]> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        let decoded = BASE64
            .decode(&self.rand)
            .map_err(|e| bolthole_crypto::CryptoError::InvalidKeyFormat(e.to_string()))?;
        Ok(sha3_digest(&decoded))
    }
}
