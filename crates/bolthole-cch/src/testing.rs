//! Protocol fixtures shared by unit and scenario tests
//!
//! Certificates built here are genuinely bound (real key, real rand
//! signature, matching nonce claim) but carry unverifiable placeholder id
//! tokens, so they pair with [`TrustingVerifier`] rather than the real
//! IdP-backed verifier.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};

use bolthole_bzcert::BzCertError;
use bolthole_crypto::{random_nonce, sha3_digest, KeyPair};
use bolthole_types::{BzCert, CchMessage, CchPayload, SynPayload};

use crate::{CertProvider, CertVerify};

/// Accepts any certificate with a fixed expiry
pub struct TrustingVerifier {
    expiry: DateTime<Utc>,
}

impl TrustingVerifier {
    pub fn valid() -> Self {
        Self {
            expiry: Utc::now() + Duration::hours(1),
        }
    }

    pub fn expired() -> Self {
        Self {
            expiry: Utc::now() - Duration::hours(1),
        }
    }
}

#[async_trait]
impl CertVerify for TrustingVerifier {
    async fn verify(&self, _cert: &BzCert) -> Result<DateTime<Utc>, BzCertError> {
        Ok(self.expiry)
    }
}

/// Hands out the same certificate on every refresh
pub struct StaticCertProvider {
    cert: BzCert,
}

impl StaticCertProvider {
    pub fn new(cert: BzCert) -> Self {
        Self { cert }
    }
}

#[async_trait]
impl CertProvider for StaticCertProvider {
    async fn refresh(&self) -> Result<BzCert, BzCertError> {
        Ok(self.cert.clone())
    }
}

/// A certificate with a real key and nonce binding, plus the key pair that
/// owns it
pub fn test_cert() -> (BzCert, KeyPair) {
    let keypair = KeyPair::generate();
    let rand = random_nonce();
    let rand_digest = sha3_digest(
        &BASE64
            .decode(&rand)
            .expect("fixture nonce is valid base64"),
    );
    let signature_on_rand = keypair
        .sign(&rand_digest)
        .expect("fixture signing cannot fail");

    let mut cert = BzCert {
        client_public_key: keypair.public_key().as_str().to_string(),
        rand,
        signature_on_rand,
        initial_id_token: String::new(),
        current_id_token: String::new(),
    };

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&serde_json::json!({
            "nonce": cert.auth_nonce(),
            "iat": Utc::now().timestamp(),
            "exp": (Utc::now() + Duration::hours(1)).timestamp(),
        }))
        .expect("fixture claims serialise"),
    );
    let token = format!("{header}.{claims}.c2ln");
    cert.initial_id_token = token.clone();
    cert.current_id_token = token;

    (cert, keypair)
}

/// A signed Syn for driving the agent engine directly
pub fn signed_syn(
    daemon_keys: &KeyPair,
    cert: &BzCert,
    target_id: &str,
    schema_version: &str,
) -> CchMessage {
    let mut syn = CchMessage::new_unsigned(CchPayload::Syn(SynPayload {
        schema_version: schema_version.to_string(),
        action: "shell/open".to_string(),
        action_payload: Vec::new(),
        target_id: target_id.to_string(),
        nonce: random_nonce(),
        bz_cert: cert.clone(),
    }));
    syn.sign(daemon_keys).expect("fixture signing cannot fail");
    syn
}
