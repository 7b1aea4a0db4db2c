//! Xray Control API Client
//!
//! Talks to the proxy's local HTTP control surface. Status mapping:
//!
//! - connection refused, 404, 405, 501: capability unavailable (the control
//!   API is not listening or this proxy build lacks the command)
//! - 409 on add / 410 on remove: already in the desired state, success
//! - everything else non-2xx: transient, retried next tick

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::types::{
    parse_user_stats, AddUserRequest, ConnectionsRequest, ConnectionsResponse, ProxyClient,
    ProxyError, QueryStatsRequest, QueryStatsResponse, RemoveUserRequest, UserCounters,
};
use crate::state::AuthorizedUser;

/// Live control of the proxy's credential set and counters
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Grant `user` on inbound `tag` without a restart
    async fn add_user(&self, tag: &str, user: &AuthorizedUser) -> Result<(), ProxyError>;

    /// Revoke credential `id` on inbound `tag` without a restart
    async fn remove_user(&self, tag: &str, id: &Uuid) -> Result<(), ProxyError>;

    /// Cumulative per-user byte counters, keyed by credential identifier
    async fn user_counters(&self) -> Result<BTreeMap<String, UserCounters>, ProxyError>;

    /// Currently open connections on inbound `tag`
    async fn active_connections(&self, tag: &str) -> Result<u64, ProxyError>;
}

/// Build the proxy's client entry for a credential
pub fn proxy_client(user: &AuthorizedUser, flow: Option<&str>) -> ProxyClient {
    ProxyClient {
        id: user.id.to_string(),
        email: user.id.to_string(),
        level: 0,
        flow: flow.map(str::to_string),
    }
}

/// HTTP client for the Xray control API
pub struct XrayApiClient {
    http_client: Client,
    api_url: String,
    flow: Option<String>,
}

impl XrayApiClient {
    pub fn new(api_url: &str, flow: Option<String>, timeout: Duration) -> Result<Self, ProxyError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(ProxyError::Transport)?;

        Ok(Self {
            http_client,
            api_url: api_url.trim_end_matches('/').to_string(),
            flow: flow.filter(|f| !f.is_empty()),
        })
    }

    async fn command<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        command: &str,
        body: &B,
    ) -> Result<Response, ProxyError> {
        let url = format!("{}/command/{}", self.api_url, command);
        debug!(url = %url, "Proxy control command");

        self.http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ProxyError::from_reqwest(operation, e))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProxyError> {
        let text = response
            .text()
            .await
            .map_err(|e| ProxyError::from_reqwest("decode", e))?;
        serde_json::from_str(&text).map_err(|e| ProxyError::Decode(e.to_string()))
    }
}

/// Map a response to success, "already done", or a classified error
async fn classify(
    operation: &'static str,
    response: Response,
    already_done: Option<StatusCode>,
) -> Result<Response, ProxyError> {
    let status = response.status();
    if status.is_success() || Some(status) == already_done {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
            Err(ProxyError::CapabilityUnavailable {
                operation,
                reason: format!("{} {}", status, body),
            })
        }
        _ => Err(ProxyError::Status { status, body }),
    }
}

#[async_trait]
impl ProxyControl for XrayApiClient {
    async fn add_user(&self, tag: &str, user: &AuthorizedUser) -> Result<(), ProxyError> {
        let client = proxy_client(user, self.flow.as_deref());
        let request = AddUserRequest { tag, user: &client };

        let response = self.command("add_user", "AddUser", &request).await?;
        classify("add_user", response, Some(StatusCode::CONFLICT)).await?;
        Ok(())
    }

    async fn remove_user(&self, tag: &str, id: &Uuid) -> Result<(), ProxyError> {
        let email = id.to_string();
        let request = RemoveUserRequest { tag, email: &email };

        let response = self.command("remove_user", "RemoveUser", &request).await?;
        classify("remove_user", response, Some(StatusCode::GONE)).await?;
        Ok(())
    }

    async fn user_counters(&self) -> Result<BTreeMap<String, UserCounters>, ProxyError> {
        let request = QueryStatsRequest {
            pattern: "user>>>",
            reset: false,
        };

        let response = self.command("query_stats", "QueryStats", &request).await?;
        let response = classify("query_stats", response, None).await?;
        let stats: QueryStatsResponse = Self::decode(response).await?;

        Ok(parse_user_stats(stats.stat))
    }

    async fn active_connections(&self, tag: &str) -> Result<u64, ProxyError> {
        let request = ConnectionsRequest { tag };

        let response = self.command("connections", "GetConnections", &request).await?;
        let response = classify("connections", response, None).await?;
        let connections: ConnectionsResponse = Self::decode(response).await?;

        Ok(connections.count)
    }
}
