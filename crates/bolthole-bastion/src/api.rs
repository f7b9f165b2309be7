//! The bastion's REST endpoints and their request/response shapes

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BastionError, BastionResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivationTokenRequest<'a> {
    target_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivationTokenResponse {
    activation_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub public_key: String,
    pub activation_token: String,
    pub version: String,
    pub environment_id: String,
    pub target_name: String,
    pub target_hostname: String,
    pub target_id: String,
    pub region: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub org_id: String,
    pub org_provider: String,
    #[serde(default)]
    pub allowed_jwks_url_patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionServiceUrlResponse {
    connection_service_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportReporter {
    pub target_id: String,
    pub agent_public_key: String,
}

/// Tells the bastion a previous process generation shut down for a
/// qualifying reason
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartReport {
    pub target_id: String,
    pub agent_public_key: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub state: HashMap<String, String>,
}

/// A significant non-fatal runtime error, shipped asynchronously
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub reporter: ReportReporter,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub state: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityTokenRequest {
    pub public_key: String,
    pub timestamp: i64,
    /// Signature over SHA3(public_key || timestamp) by the agent key
    pub signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityTokenResponse {
    token: String,
}

pub struct BastionClient {
    http: reqwest::Client,
    service_url: String,
}

impl BastionClient {
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            service_url: service_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.service_url)
    }

    /// Exchange an API key for a one-shot activation token
    pub async fn activation_token(
        &self,
        api_key: &str,
        target_name: &str,
    ) -> BastionResult<String> {
        let response = self
            .http
            .post(self.url("/api/v2/agent/token"))
            .header("X-API-KEY", api_key)
            .json(&ActivationTokenRequest { target_name })
            .send()
            .await?;
        let parsed: ActivationTokenResponse = checked_json(response).await?;
        Ok(parsed.activation_token)
    }

    /// Register this agent's identity with the bastion
    pub async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> BastionResult<RegistrationResponse> {
        let response = self
            .http
            .post(self.url("/api/v2/agent/register"))
            .json(request)
            .send()
            .await?;
        checked_json(response).await
    }

    /// The websocket endpoint connections should dial
    pub async fn connection_service_url(&self) -> BastionResult<String> {
        let response = self
            .http
            .get(self.url("/api/v2/connection-service/url"))
            .send()
            .await?;
        let parsed: ConnectionServiceUrlResponse = checked_json(response).await?;
        Ok(parsed.connection_service_url)
    }

    /// Ask the connection service which region we landed in
    pub async fn region(&self) -> BastionResult<String> {
        let connection_url = self.connection_service_url().await?;
        let response = self
            .http
            .get(format!(
                "{}/status/where",
                connection_url.trim_end_matches('/')
            ))
            .send()
            .await?;
        let body = checked_text(response).await?;
        let region = body.trim().trim_matches('"').to_string();
        debug!(%region, "resolved region");
        Ok(region)
    }

    pub async fn report_restart(
        &self,
        bearer_token: &str,
        report: &RestartReport,
    ) -> BastionResult<()> {
        let response = self
            .http
            .post(self.url("/api/v2/agent/restart"))
            .bearer_auth(bearer_token)
            .json(report)
            .send()
            .await?;
        checked_text(response).await?;
        Ok(())
    }

    pub async fn report_error(
        &self,
        bearer_token: &str,
        report: &ErrorReport,
    ) -> BastionResult<()> {
        let response = self
            .http
            .post(self.url("/api/v2/agent/error"))
            .bearer_auth(bearer_token)
            .json(report)
            .send()
            .await?;
        checked_text(response).await?;
        Ok(())
    }

    /// Fetch a fresh agent-identity bearer token with a signed request
    pub async fn fetch_identity_token(
        &self,
        request: &IdentityTokenRequest,
    ) -> BastionResult<String> {
        let response = self
            .http
            .post(self.url("/api/v2/agent/identity-token"))
            .json(request)
            .send()
            .await?;
        let parsed: IdentityTokenResponse = checked_json(response).await?;
        Ok(parsed.token)
    }
}


async fn checked(response: reqwest::Response) -> BastionResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BastionError::Api {
        status: status.as_u16(),
        body,
    })
}

async fn checked_json<T: DeserializeOwned>(response: reqwest::Response) -> BastionResult<T> {
    Ok(checked(response).await?.json().await?)
}

async fn checked_text(response: reqwest::Response) -> BastionResult<String> {
    Ok(checked(response).await?.text().await?)
}
