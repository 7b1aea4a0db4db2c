//! Control Plane HTTP Client
//!
//! Typed wrapper over the control plane's node API. Every request carries the
//! shared secret as a bearer token and a bounded timeout. No retries here;
//! callers decide what a failure means.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::types::{
    ControlPlaneError, HealthReport, RegisterRequest, RegisterResponse, RemoteUser, TrafficReport,
};

/// Operations the agent needs from the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register (or upsert, when `request.id` is set) this node; returns its ID
    async fn register(&self, request: &RegisterRequest) -> Result<String, ControlPlaneError>;

    async fn send_health(&self, report: &HealthReport) -> Result<(), ControlPlaneError>;

    async fn send_traffic(&self, report: &TrafficReport) -> Result<(), ControlPlaneError>;

    /// Authorized users for `node_id`, active and suspended alike
    async fn fetch_users(&self, node_id: &str) -> Result<Vec<RemoteUser>, ControlPlaneError>;
}

/// reqwest-backed control plane client
pub struct HttpControlPlane {
    http_client: Client,
    base_url: String,
    api_key: String,
}

impl HttpControlPlane {
    /// Create a client for `base_url` (e.g. `https://cp.example.com/api/v1/nodes`)
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ControlPlaneError> {
        reqwest::Url::parse(base_url)
            .map_err(|e| ControlPlaneError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        let http_client = Client::builder()
            .user_agent(concat!("fleet-node-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(ControlPlaneError::Transport)?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, ControlPlaneError> {
        let url = self.url(path);
        debug!(url = %url, "POST control plane");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(ControlPlaneError::from_reqwest)?;

        check_status(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ControlPlaneError> {
        let text = response
            .text()
            .await
            .map_err(ControlPlaneError::from_reqwest)?;
        serde_json::from_str(&text).map_err(|e| ControlPlaneError::Decode(e.to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, ControlPlaneError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ControlPlaneError::Unauthorized { status });
    }

    let body = response.text().await.unwrap_or_default();
    Err(ControlPlaneError::Status { status, body })
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self, request: &RegisterRequest) -> Result<String, ControlPlaneError> {
        let response = self.post_json("/register", request).await?;
        let registered: RegisterResponse = Self::decode(response).await?;
        Ok(registered.id)
    }

    async fn send_health(&self, report: &HealthReport) -> Result<(), ControlPlaneError> {
        self.post_json("/health", report).await?;
        Ok(())
    }

    async fn send_traffic(&self, report: &TrafficReport) -> Result<(), ControlPlaneError> {
        self.post_json("/traffic", report).await?;
        Ok(())
    }

    async fn fetch_users(&self, node_id: &str) -> Result<Vec<RemoteUser>, ControlPlaneError> {
        let url = self.url("/users");
        debug!(url = %url, node_id = %node_id, "GET control plane users");

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("node_id", node_id)])
            .send()
            .await
            .map_err(ControlPlaneError::from_reqwest)?;

        let response = check_status(response).await?;
        Self::decode(response).await
    }
}
