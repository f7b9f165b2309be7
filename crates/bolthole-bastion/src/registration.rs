//! One-shot identity bootstrap
//!
//! Registration runs once per target: obtain an activation token (or use
//! one supplied out of band), generate the key pair, announce the public
//! key to the bastion along with hostname, environment and region, and
//! persist the returned identity settings. Later startups skip all of
//! this unless re-registration is forced.

use tracing::info;
use uuid::Uuid;

use bolthole_config::{AgentConfig, ConfigBackend, ConfigError};
use bolthole_crypto::KeyPair;

use crate::api::{BastionClient, RegistrationRequest};
use crate::{BastionError, BastionResult};

const PERSIST_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    pub service_url: String,
    pub activation_token: Option<String>,
    pub api_key: Option<String>,
    pub environment_id: String,
    pub target_name: String,
    pub version: String,
}

/// Register this agent and persist its new identity. The caller decides
/// whether to run at all (fresh install or forced re-registration).
pub async fn register<B: ConfigBackend<AgentConfig> + ?Sized>(
    client: &BastionClient,
    store: &mut B,
    options: &RegistrationOptions,
) -> BastionResult<AgentConfig> {
    let mut config = store.fetch().await?;

    let activation_token = match &options.activation_token {
        Some(token) => token.clone(),
        None => {
            let api_key = options
                .api_key
                .as_deref()
                .ok_or(BastionError::MissingCredentials(
                    "an activation token or api key is required to register",
                ))?;
            client
                .activation_token(api_key, &options.target_name)
                .await?
        }
    };

    let keypair = KeyPair::generate();
    let region = client.region().await?;
    let target_id = if config.target_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        // Re-registration keeps the target identity stable.
        config.target_id.clone()
    };

    let request = RegistrationRequest {
        public_key: keypair.public_key().as_str().to_string(),
        activation_token,
        version: options.version.clone(),
        environment_id: options.environment_id.clone(),
        target_name: options.target_name.clone(),
        target_hostname: hostname(&options.target_name),
        target_id: target_id.clone(),
        region,
    };
    let response = client.register(&request).await?;
    info!(target_id = %target_id, provider = %response.org_provider, "registered with bastion");

    config.version = options.version.clone();
    config.public_key = keypair.public_key().as_str().to_string();
    config.private_key = keypair.private_key_base64();
    config.target_id = target_id;
    config.idp_provider = response.org_provider;
    config.idp_org_id = response.org_id;
    config.service_url = options.service_url.clone();
    config.jwks_url_patterns = response.allowed_jwks_url_patterns;
    config.agent_identity_token = String::new();

    persist(store, &mut config).await?;
    Ok(config)
}

/// Save with conflict retries: another process may touch the config
/// between our fetch and save, so merge onto the fresh copy and retry.
async fn persist<B: ConfigBackend<AgentConfig> + ?Sized>(
    store: &mut B,
    config: &mut AgentConfig,
) -> BastionResult<()> {
    for _ in 0..PERSIST_ATTEMPTS {
        match store.save(config).await {
            Ok(()) => return Ok(()),
            Err(ConfigError::ChangedSinceFetch) => {
                let fresh = store.fetch().await?;
                // Keep the other writer's lifecycle fields; the identity
                // fields we just minted win.
                config.shutdown_reason = fresh.shutdown_reason;
                config.shutdown_state = fresh.shutdown_state;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(BastionError::PersistRetriesExhausted)
}

fn hostname(fallback: &str) -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
