//! Control plane wire types and errors

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state::{AuthorizedUser, NodeIdentity};

/// Body of `POST /register`.
///
/// Carrying `id` turns the call into an upsert of the existing record.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
    pub country: String,
    pub country_code: String,
    pub city: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub sni: String,
    pub api_url: String,
}

impl From<&NodeIdentity> for RegisterRequest {
    fn from(identity: &NodeIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            hostname: identity.hostname.clone(),
            ip_address: identity.ip_address.clone(),
            port: identity.port,
            country: identity.country.clone(),
            country_code: identity.country_code.clone(),
            city: identity.city.clone(),
            public_key: identity.public_key.clone(),
            short_id: identity.short_id.clone(),
            sni: identity.sni.clone(),
            api_url: identity.api_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
}

/// Body of `POST /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub node_id: String,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub active_connections: Option<u64>,
    pub is_healthy: bool,
    pub timestamp: DateTime<Utc>,
}

/// One user's traffic since the last confirmed report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficRecord {
    pub credential_id: String,
    pub upload: u64,
    pub download: u64,
}

/// Body of `POST /traffic`
#[derive(Debug, Clone, Serialize)]
pub struct TrafficReport {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub records: Vec<TrafficRecord>,
}

/// Entry of `GET /users`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteUser {
    pub id: Uuid,
    #[serde(default, alias = "email")]
    pub label: String,
    #[serde(default = "default_true", alias = "is_active")]
    pub active: bool,
    #[serde(default, alias = "traffic_limit")]
    pub quota_bytes: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl From<&RemoteUser> for AuthorizedUser {
    fn from(remote: &RemoteUser) -> Self {
        Self {
            id: remote.id,
            label: remote.label.clone(),
            active: remote.active,
            quota_bytes: remote.quota_bytes,
        }
    }
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) if !s.is_empty() => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected node id string or number, got {}",
            other
        ))),
    }
}

/// Errors returned by the control plane client
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Connection, DNS or protocol failure
    #[error("control plane unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    /// The call exceeded its deadline
    #[error("control plane request timed out")]
    Timeout,

    /// Shared secret rejected
    #[error("control plane rejected credentials ({status})")]
    Unauthorized { status: StatusCode },

    /// Any other non-2xx answer
    #[error("control plane returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// Response body did not match the expected shape
    #[error("invalid control plane response: {0}")]
    Decode(String),

    /// Base URL or endpoint could not be built
    #[error("invalid control plane URL: {0}")]
    InvalidUrl(String),
}

impl ControlPlaneError {
    /// Authentication failures are fatal at registration only
    pub fn is_auth(&self) -> bool {
        matches!(self, ControlPlaneError::Unauthorized { .. })
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ControlPlaneError::Timeout
        } else if err.is_decode() {
            ControlPlaneError::Decode(err.to_string())
        } else {
            ControlPlaneError::Transport(err)
        }
    }
}
