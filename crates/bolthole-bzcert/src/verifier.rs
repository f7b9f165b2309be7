//! The certificate verifier

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;

use bolthole_types::BzCert;

use crate::idp::{discover_jwks, fetch_jwks, token_jku, unverified_claims, verify_against_jwks};
use crate::service_account::check_allowed;
use crate::{BzCertError, BzCertResult, IdpProvider, TokenError};

/// Initial id tokens outlive their `exp`; they are bounded by issuance age
/// instead.
const INITIAL_ID_TOKEN_LIFETIME_DAYS: i64 = 5 * 365;

/// Registration-time identity settings the verifier enforces
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub provider: IdpProvider,
    pub org_id: String,
    pub allowed_jwks_url_patterns: Vec<String>,
}

/// Validates workstation certificates against the configured IdP
pub struct BzCertVerifier {
    config: VerifierConfig,
    http: reqwest::Client,
}

impl BzCertVerifier {
    pub fn new(config: VerifierConfig) -> BzCertResult<Self> {
        match config.provider {
            IdpProvider::Google | IdpProvider::Microsoft if config.org_id.is_empty() => {
                return Err(BzCertError::CertConfig(format!(
                    "provider {} requires an org id",
                    config.provider
                )));
            }
            IdpProvider::Okta | IdpProvider::OneLogin if config.org_id.is_empty() => {
                return Err(BzCertError::CertConfig(format!(
                    "provider {} requires an org domain",
                    config.provider
                )));
            }
            _ => {}
        }

        Ok(Self {
            config,
            http: reqwest::Client::new(),
        })
    }

    /// Verify a certificate and return the expiry of its current id token
    pub async fn verify(&self, cert: &BzCert) -> BzCertResult<DateTime<Utc>> {
        let jku = token_jku(&cert.current_id_token)
            .map_err(BzCertError::CurrentIdToken)?;

        match jku {
            Some(jku) => self.verify_service_account(cert, &jku).await,
            None => self.verify_user(cert).await,
        }
    }

    async fn verify_user(&self, cert: &BzCert) -> BzCertResult<DateTime<Utc>> {
        self.verify_auth_nonce(cert)
            .map_err(BzCertError::InitialIdToken)?;

        let issuer = self.config.provider.issuer_url(&self.config.org_id);
        let jwks = discover_jwks(&self.http, &issuer)
            .await
            .map_err(BzCertError::InitialIdToken)?;

        // Initial token: signature-valid and issued within the window, but
        // its own exp is ignored.
        let initial_claims = verify_against_jwks(&cert.initial_id_token, &jwks, false)
            .map_err(BzCertError::InitialIdToken)?;
        check_initial_window(&initial_claims, Utc::now()).map_err(BzCertError::InitialIdToken)?;
        self.config
            .provider
            .check_org_claim(&initial_claims, &self.config.org_id)
            .map_err(BzCertError::InitialIdToken)?;

        // Current token: fully verified including exp.
        let current_claims = verify_against_jwks(&cert.current_id_token, &jwks, true)
            .map_err(BzCertError::CurrentIdToken)?;
        self.config
            .provider
            .check_org_claim(&current_claims, &self.config.org_id)
            .map_err(BzCertError::CurrentIdToken)?;

        let expires_at =
            claim_timestamp(&current_claims, "exp").map_err(BzCertError::CurrentIdToken)?;
        debug!(provider = %self.config.provider, %expires_at, "verified user certificate");
        Ok(expires_at)
    }

    async fn verify_service_account(
        &self,
        cert: &BzCert,
        jku: &str,
    ) -> BzCertResult<DateTime<Utc>> {
        let email = check_allowed(jku, &self.config.allowed_jwks_url_patterns)
            .map_err(BzCertError::ServiceAccount)?;

        // JWKS comes from the verbatim jku, not from the extracted pattern.
        let jwks = fetch_jwks(&self.http, jku)
            .await
            .map_err(BzCertError::ServiceAccount)?;
        let claims = verify_against_jwks(&cert.current_id_token, &jwks, true)
            .map_err(BzCertError::ServiceAccount)?;

        self.verify_auth_nonce(cert)
            .map_err(BzCertError::ServiceAccount)?;

        let expires_at = claim_timestamp(&claims, "exp").map_err(BzCertError::ServiceAccount)?;
        debug!(%email, %expires_at, "verified service account certificate");
        Ok(expires_at)
    }

    /// Recompute the auth nonce, compare it to the initial token's `nonce`
    /// claim, and verify the rand signature under the certificate key.
    fn verify_auth_nonce(&self, cert: &BzCert) -> Result<(), TokenError> {
        let claims = unverified_claims(&cert.initial_id_token)?;
        let nonce = claims
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or(TokenError::MissingClaim("nonce"))?;

        if nonce != cert.auth_nonce() {
            return Err(TokenError::NonceMismatch);
        }

        let digest = cert.rand_digest()?;
        cert.public_key().verify(&digest, &cert.signature_on_rand)?;
        Ok(())
    }
}

fn claim_timestamp(claims: &Value, claim: &'static str) -> Result<DateTime<Utc>, TokenError> {
    let seconds = claims
        .get(claim)
        .and_then(Value::as_i64)
        .ok_or(TokenError::MissingClaim(claim))?;
    DateTime::from_timestamp(seconds, 0).ok_or(TokenError::Expired(seconds))
}

fn check_initial_window(claims: &Value, now: DateTime<Utc>) -> Result<(), TokenError> {
    let iat = claims
        .get("iat")
        .and_then(Value::as_i64)
        .ok_or(TokenError::MissingClaim("iat"))?;
    let issued_at =
        DateTime::from_timestamp(iat, 0).ok_or(TokenError::InitialWindowExceeded { iat })?;

    if issued_at + Duration::days(INITIAL_ID_TOKEN_LIFETIME_DAYS) <= now {
        return Err(TokenError::InitialWindowExceeded { iat });
    }
    Ok(())
}
