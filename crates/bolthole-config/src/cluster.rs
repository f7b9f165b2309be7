//! Cluster-secret backend (Kubernetes)
//!
//! Same contract as the file backend with the Secret's `resourceVersion`
//! standing in for the file mtime: replacing a Secret with a stale
//! resourceVersion is rejected by the API server, which surfaces here as
//! [`ConfigError::ChangedSinceFetch`].

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ConfigBackend, ConfigDoc, ConfigError, ConfigResult};

/// Registration polling cadence; the API server has no cheap equivalent
/// of the file backend's write events for a single Secret.
const REGISTRATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ClusterBackend<T> {
    api: Api<Secret>,
    secret_name: String,
    last_resource_version: Option<String>,
    _marker: PhantomData<T>,
}

impl<T: ConfigDoc> ClusterBackend<T> {
    /// Connect using the in-cluster (or kubeconfig) environment
    pub async fn new(target_name: &str) -> ConfigResult<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self::with_client(client, target_name))
    }

    pub fn with_client(client: kube::Client, target_name: &str) -> Self {
        Self {
            api: Api::default_namespaced(client),
            secret_name: T::secret_name(target_name),
            last_resource_version: None,
            _marker: PhantomData,
        }
    }

    fn decode(&self, secret: &Secret) -> ConfigResult<T> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(T::SECRET_DATA_KEY))
            .map(|value| value.0.clone())
            .unwrap_or_default();

        if bytes.is_empty() {
            return Ok(T::default());
        }
        if let Some(document) = T::from_legacy_bytes(&bytes) {
            debug!(secret = %self.secret_name, "read legacy binary secret payload");
            return Ok(document);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl<T: ConfigDoc> ConfigBackend<T> for ClusterBackend<T> {
    async fn fetch(&mut self) -> ConfigResult<T> {
        match self.api.get(&self.secret_name).await {
            Ok(secret) => {
                self.last_resource_version = secret.metadata.resource_version.clone();
                self.decode(&secret)
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                self.last_resource_version = None;
                Ok(T::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&mut self, document: &T) -> ConfigResult<()> {
        let mut data = BTreeMap::new();
        data.insert(
            T::SECRET_DATA_KEY.to_string(),
            ByteString(serde_json::to_vec(document)?),
        );
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name.clone()),
                resource_version: self.last_resource_version.clone(),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        let result = match self.last_resource_version {
            None => self.api.create(&PostParams::default(), &secret).await,
            Some(_) => {
                self.api
                    .replace(&self.secret_name, &PostParams::default(), &secret)
                    .await
            }
        };

        match result {
            Ok(saved) => {
                self.last_resource_version = saved.metadata.resource_version;
                Ok(())
            }
            // 409 covers both a stale resourceVersion on replace and a
            // create racing another writer.
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(ConfigError::ChangedSinceFetch)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_for_registration(&mut self, cancel: &CancellationToken) -> ConfigResult<T> {
        loop {
            let document = self.fetch().await?;
            if document.is_registered() {
                return Ok(document);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ConfigError::Cancelled),
                _ = tokio::time::sleep(REGISTRATION_POLL_INTERVAL) => {}
            }
        }
    }
}
