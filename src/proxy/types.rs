//! Proxy control types and errors

use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::state::StoreError;

/// A client entry as the proxy understands it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyClient {
    pub id: String,
    /// Stats are keyed by email, so it carries the credential ID
    pub email: String,
    pub level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AddUserRequest<'a> {
    pub tag: &'a str,
    pub user: &'a ProxyClient,
}

#[derive(Debug, Serialize)]
pub(crate) struct RemoveUserRequest<'a> {
    pub tag: &'a str,
    pub email: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct QueryStatsRequest<'a> {
    pub pattern: &'a str,
    pub reset: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueryStatsResponse {
    #[serde(default)]
    pub stat: Vec<StatEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatEntry {
    pub name: String,
    #[serde(default, deserialize_with = "u64_from_number_or_string")]
    pub value: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ConnectionsRequest<'a> {
    pub tag: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectionsResponse {
    #[serde(default, deserialize_with = "u64_from_number_or_string")]
    pub count: u64,
}

/// Raw cumulative counters for one credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCounters {
    pub uplink: u64,
    pub downlink: u64,
}

/// Fold `user>>>{email}>>>traffic>>>{uplink|downlink}` entries into per-user counters
pub(crate) fn parse_user_stats(entries: Vec<StatEntry>) -> BTreeMap<String, UserCounters> {
    let mut out: BTreeMap<String, UserCounters> = BTreeMap::new();

    for entry in entries {
        let parts: Vec<&str> = entry.name.split(">>>").collect();
        let ["user", email, "traffic", direction] = parts.as_slice() else {
            continue;
        };

        let counters = out.entry(email.to_string()).or_default();
        match *direction {
            "uplink" => counters.uplink = entry.value,
            "downlink" => counters.downlink = entry.value,
            _ => {}
        }
    }

    out
}

/// gRPC gateways render int64 as strings
fn u64_from_number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v.max(0) as u64))
            .ok_or_else(|| serde::de::Error::custom("counter out of range")),
        serde_json::Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        serde_json::Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!(
            "expected counter, got {}",
            other
        ))),
    }
}

/// Errors from the proxy control surface, the config file and reloads
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The no-downtime API path cannot be used on this proxy
    #[error("proxy control API unavailable for {operation}: {reason}")]
    CapabilityUnavailable {
        operation: &'static str,
        reason: String,
    },

    /// Transient transport failure talking to the control API
    #[error("proxy control API transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("proxy control API request timed out")]
    Timeout,

    #[error("proxy control API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid proxy control API response: {0}")]
    Decode(String),

    /// The proxy configuration document is unusable
    #[error("proxy config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Writing the proxy configuration failed
    #[error("failed to write proxy config: {0}")]
    Persist(#[from] StoreError),

    /// The reload command failed or timed out
    #[error("proxy reload `{command}` failed: {reason}")]
    Reload { command: String, reason: String },
}

impl ProxyError {
    /// Only this class of failure justifies the disruptive config-reload path
    pub fn is_capability_unavailable(&self) -> bool {
        matches!(self, ProxyError::CapabilityUnavailable { .. })
    }

    pub(crate) fn from_reqwest(operation: &'static str, err: reqwest::Error) -> Self {
        if err.is_connect() {
            ProxyError::CapabilityUnavailable {
                operation,
                reason: format!("control API not listening: {}", err),
            }
        } else if err.is_timeout() {
            ProxyError::Timeout
        } else if err.is_decode() {
            ProxyError::Decode(err.to_string())
        } else {
            ProxyError::Transport(err)
        }
    }
}
