//! Agent-identity token cache
//!
//! The bearer token for bastion REST calls is fetched with a signed
//! request and cached until its `exp` claim. The cache's mutex is held
//! across the refresh, so concurrent callers coalesce onto a single
//! fetch instead of stampeding the bastion.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use bolthole_crypto::{sha3_digest, KeyPair};

use crate::api::{BastionClient, IdentityTokenRequest};
use crate::BastionResult;

/// Refresh slightly early so in-flight requests never carry a token that
/// expires mid-call.
fn expiry_margin() -> Duration {
    Duration::seconds(60)
}

/// Fallback lifetime for tokens whose `exp` claim cannot be read
fn fallback_lifetime() -> Duration {
    Duration::minutes(5)
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct IdentityTokenCache {
    client: BastionClient,
    keypair: KeyPair,
    cached: Mutex<Option<CachedToken>>,
}

impl IdentityTokenCache {
    /// Optionally seeded from the persisted config; an expired seed is
    /// discarded on first use.
    pub fn new(client: BastionClient, keypair: KeyPair, seed: Option<String>) -> Self {
        let cached = seed
            .filter(|token| !token.is_empty())
            .map(|token| CachedToken {
                expires_at: token_expiry(&token).unwrap_or_else(Utc::now),
                token,
            });
        Self {
            client,
            keypair,
            cached: Mutex::new(cached),
        }
    }

    /// The current bearer token, refreshed when stale
    pub async fn get(&self) -> BastionResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref() {
            if current.expires_at - expiry_margin() > Utc::now() {
                return Ok(current.token.clone());
            }
        }

        let token = self.fetch().await?;
        let expires_at =
            token_expiry(&token).unwrap_or_else(|| Utc::now() + fallback_lifetime());
        debug!(%expires_at, "refreshed agent identity token");
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    async fn fetch(&self) -> BastionResult<String> {
        let public_key = self.keypair.public_key().as_str().to_string();
        let timestamp = Utc::now().timestamp();
        let digest = sha3_digest(format!("{public_key}{timestamp}").as_bytes());
        let signature = self.keypair.sign(&digest)?;

        self.client
            .fetch_identity_token(&IdentityTokenRequest {
                public_key,
                timestamp,
                signature,
            })
            .await
    }
}

/// The `exp` claim of a JWT, read without verification; the bastion is
/// the authority on its own tokens.
fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    let claims = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(claims).ok()?;
    let parsed: Value = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(parsed.get("exp")?.as_i64()?, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    fn token_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let claims =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&serde_json::json!({"exp": exp})).unwrap());
        format!("{header}.{claims}.c2ln")
    }

    #[test]
    fn test_token_expiry_reads_exp_claim() {
        let expires_at = token_expiry(&token_with_exp(1900000000)).unwrap();
        assert_eq!(expires_at.timestamp(), 1900000000);
    }

    #[test]
    fn test_token_expiry_tolerates_garbage() {
        assert!(token_expiry("not-a-jwt").is_none());
        assert!(token_expiry("a.b.c").is_none());
    }

    #[tokio::test]
    async fn test_fresh_seed_is_served_without_fetching() {
        let future_exp = (Utc::now() + Duration::hours(1)).timestamp();
        let seed = token_with_exp(future_exp);
        // The client points nowhere; a fetch attempt would fail loudly.
        let cache = IdentityTokenCache::new(
            BastionClient::new("http://127.0.0.1:1"),
            KeyPair::generate(),
            Some(seed.clone()),
        );

        assert_eq!(cache.get().await.unwrap(), seed);
    }

    #[tokio::test]
    async fn test_expired_seed_forces_a_refresh() {
        let stale = token_with_exp((Utc::now() - Duration::hours(1)).timestamp());
        let cache = IdentityTokenCache::new(
            BastionClient::new("http://127.0.0.1:1"),
            KeyPair::generate(),
            Some(stale),
        );

        // The refresh hits the dead endpoint and fails, proving the stale
        // seed was not served.
        assert!(cache.get().await.is_err());
    }
}
