//! Ed25519 key management
//!
//! A key pair is the cryptographic identity of an agent or daemon. The
//! public half travels as a base64 string; the private half is only ever
//! exported for the config store.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{CryptoError, CryptoResult};

/// An Ed25519 key pair used for message signing
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Restore a key pair from its base64-encoded private key
    pub fn from_base64(private_key: &str) -> CryptoResult<Self> {
        let bytes = BASE64
            .decode(private_key)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;

        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyFormat(
                "private key must be 32 bytes".to_string(),
            ));
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&bytes);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// The shareable public half
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(BASE64.encode(self.verifying_key.as_bytes()))
    }

    /// Export the private key for persistence (base64)
    pub fn private_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.to_bytes())
    }

    /// Sign a digest, returning the base64 signature
    pub fn sign(&self, digest: &[u8]) -> CryptoResult<String> {
        let signature = self
            .signing_key
            .try_sign(digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        Ok(BASE64.encode(signature.to_bytes()))
    }
}

/// A public key in its string (base64) wire form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse into a dalek verifying key
    pub fn to_verifying_key(&self) -> CryptoResult<VerifyingKey> {
        let bytes = BASE64
            .decode(&self.0)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;

        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyFormat(
                "public key must be 32 bytes".to_string(),
            ));
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&bytes);

        VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))
    }

    /// Verify a base64 signature over a digest
    pub fn verify(&self, digest: &[u8], signature: &str) -> CryptoResult<()> {
        let signature_bytes = BASE64
            .decode(signature)
            .map_err(|e| CryptoError::VerificationFailed(e.to_string()))?;

        if signature_bytes.len() != 64 {
            return Err(CryptoError::VerificationFailed(
                "signature must be 64 bytes".to_string(),
            ));
        }

        let mut sig_array = [0u8; 64];
        sig_array.copy_from_slice(&signature_bytes);
        let signature = Ed25519Signature::from_bytes(&sig_array);

        self.to_verifying_key()?
            .verify(digest, &signature)
            .map_err(|e| CryptoError::VerificationFailed(e.to_string()))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fresh random nonce in base64 form (32 bytes of entropy)
pub fn random_nonce() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::sha3_digest;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let digest = sha3_digest(b"the message body");

        let signature = keypair.sign(&digest).unwrap();
        keypair.public_key().verify(&digest, &signature).unwrap();
    }

    #[test]
    fn test_wrong_digest_fails() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(&sha3_digest(b"one")).unwrap();

        assert!(keypair
            .public_key()
            .verify(&sha3_digest(b"two"), &signature)
            .is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair = KeyPair::generate();
        let other = KeyPair::generate();
        let digest = sha3_digest(b"payload");
        let signature = keypair.sign(&digest).unwrap();

        assert!(other.public_key().verify(&digest, &signature).is_err());
    }

    #[test]
    fn test_round_trip_through_base64() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_base64(&keypair.private_key_base64()).unwrap();

        assert_eq!(keypair.public_key(), restored.public_key());

        let digest = sha3_digest(b"persisted identity");
        let signature = restored.sign(&digest).unwrap();
        keypair.public_key().verify(&digest, &signature).unwrap();
    }

    #[test]
    fn test_random_nonce_is_unique() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
