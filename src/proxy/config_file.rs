//! Proxy Configuration File
//!
//! Fallback path for credential changes: regenerate the managed inbound's
//! `settings.clients` list from the authorized set and atomically replace the
//! file. Every other part of the document (policy, outbounds, stream
//! settings, other inbounds) is preserved as is.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::client::proxy_client;
use super::types::ProxyError;
use crate::state::atomic::persist_json;
use crate::state::{AuthorizedUser, UserSetGuard};

/// The proxy's persisted JSON configuration
#[derive(Debug, Clone)]
pub struct ProxyConfigFile {
    path: PathBuf,
    inbound_tag: String,
    flow: Option<String>,
}

impl ProxyConfigFile {
    pub fn new(path: impl Into<PathBuf>, inbound_tag: impl Into<String>, flow: Option<String>) -> Self {
        Self {
            path: path.into(),
            inbound_tag: inbound_tag.into(),
            flow: flow.filter(|f| !f.is_empty()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make the managed inbound's client list match `users`.
    ///
    /// Requires the user-set guard so the file is never written outside the
    /// shared proxy-state lock.
    pub async fn sync_clients(
        &self,
        _held: &UserSetGuard<'_>,
        users: &BTreeMap<Uuid, AuthorizedUser>,
    ) -> Result<ClientsRewrite, ProxyError> {
        let mut document = self.read().await?;
        let clients = self.clients_mut(&mut document)?;

        let (regenerated, relabeled) = regenerate_clients(clients, users, self.flow.as_deref());
        if *clients == regenerated {
            debug!(path = %self.path.display(), "Proxy config already matches authorized set");
            return Ok(ClientsRewrite::default());
        }

        *clients = regenerated;
        persist_json(&self.path, &document).await?;

        info!(
            path = %self.path.display(),
            inbound = %self.inbound_tag,
            clients = users.len(),
            relabeled,
            "Rewrote proxy config"
        );
        Ok(ClientsRewrite {
            changed: true,
            relabeled,
        })
    }

    async fn read(&self) -> Result<Value, ProxyError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.config_error(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| self.config_error(format!("invalid JSON: {}", e)))
    }

    fn clients_mut<'v>(&self, document: &'v mut Value) -> Result<&'v mut Vec<Value>, ProxyError> {
        let inbound = document
            .get_mut("inbounds")
            .and_then(Value::as_array_mut)
            .and_then(|inbounds| {
                inbounds
                    .iter_mut()
                    .find(|i| i.get("tag").and_then(Value::as_str) == Some(self.inbound_tag.as_str()))
            })
            .ok_or_else(|| self.config_error(format!("no inbound tagged '{}'", self.inbound_tag)))?;

        let settings = inbound
            .as_object_mut()
            .ok_or_else(|| self.config_error("inbound is not an object".to_string()))?
            .entry("settings")
            .or_insert_with(|| Value::Object(Default::default()));

        let clients = settings
            .as_object_mut()
            .ok_or_else(|| self.config_error("inbound settings is not an object".to_string()))?
            .entry("clients")
            .or_insert_with(|| Value::Array(Vec::new()));

        clients
            .as_array_mut()
            .ok_or_else(|| self.config_error("settings.clients is not an array".to_string()))
    }

    fn config_error(&self, reason: String) -> ProxyError {
        ProxyError::Config {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Outcome of [`ProxyConfigFile::sync_clients`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientsRewrite {
    /// The file was rewritten
    pub changed: bool,
    /// Kept entries whose `email` was not their credential ID
    pub relabeled: usize,
}

/// Rebuild a client list for `users`.
///
/// Entries already present keep their other fields and order, with `email`
/// forced to the credential ID so stats and removals key on it. Missing
/// users are appended; entries for anyone else, and duplicates, are dropped.
/// Also returns how many kept entries had a different `email`.
pub fn regenerate_clients(
    existing: &[Value],
    users: &BTreeMap<Uuid, AuthorizedUser>,
    flow: Option<&str>,
) -> (Vec<Value>, usize) {
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut out = Vec::with_capacity(users.len());
    let mut relabeled = 0;

    for client in existing {
        let id = client
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());

        let Some(id) = id else { continue };
        if !users.contains_key(&id) || !seen.insert(id) {
            continue;
        }

        let mut entry = client.clone();
        let email = id.to_string();
        if entry.get("email").and_then(Value::as_str) != Some(email.as_str()) {
            relabeled += 1;
            if let Some(fields) = entry.as_object_mut() {
                fields.insert("email".to_string(), Value::String(email));
            }
        }
        out.push(entry);
    }

    for (id, user) in users {
        if seen.contains(id) {
            continue;
        }
        if let Ok(entry) = serde_json::to_value(proxy_client(user, flow)) {
            out.push(entry);
        }
    }

    (out, relabeled)
}
