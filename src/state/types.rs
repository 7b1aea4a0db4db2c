//! Persisted state types
//!
//! The on-disk document mirrors what this node has granted: the node identity
//! (with the control-plane assigned ID once known) and the authorized users.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Current layout version of the state document
pub const STATE_VERSION: u32 = 1;

/// Public identity of this node as known to the control plane.
///
/// Only public-facing masquerading parameters live here. The Reality private
/// key is provisioned at install time and never leaves the proxy config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Assigned by the control plane on first registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
    pub country: String,
    pub country_code: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub short_id: Option<String>,
    pub sni: String,
    /// Proxy control URL advertised to the control plane
    pub api_url: String,
}

impl NodeIdentity {
    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }
}

/// A credential granted on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub id: Uuid,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
}

fn default_active() -> bool {
    true
}

/// The whole persisted document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub identity: NodeIdentity,
    #[serde(default)]
    pub users: BTreeMap<Uuid, AuthorizedUser>,
}

impl PersistedState {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            version: STATE_VERSION,
            identity,
            users: BTreeMap::new(),
        }
    }

    /// Apply a diff in place: additions first, then removals
    pub fn apply(&mut self, diff: &UserDiff) {
        for user in &diff.to_add {
            self.users.insert(user.id, user.clone());
        }
        for id in &diff.to_remove {
            self.users.remove(id);
        }
    }
}

/// Difference between the desired and the current authorized set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDiff {
    pub to_add: Vec<AuthorizedUser>,
    pub to_remove: Vec<Uuid>,
}

impl UserDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }

    pub fn extend(&mut self, other: UserDiff) {
        self.to_add.extend(other.to_add);
        self.to_remove.extend(other.to_remove);
    }
}

/// Errors from the local state store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading, writing or renaming a file failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document on disk does not parse
    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serializing the in-memory document failed
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The document was written by a newer agent
    #[error("unsupported state version {found} (expected <= {STATE_VERSION})")]
    UnsupportedVersion { found: u32 },
}
