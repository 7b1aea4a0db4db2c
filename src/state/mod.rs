//! Local State Store
//!
//! Persisted, authoritative-on-disk mirror of the users granted on this node
//! plus the node identity. All access to the authorized set (and to the proxy
//! configuration file, see [`crate::proxy::ProxyConfigFile`]) goes through a
//! single async read/write lock:
//!
//! - user sync holds [`UserSetGuard`] (write side) for its whole
//!   read-diff-apply cycle
//! - traffic sync takes a non-blocking read snapshot and skips it when busy
//!
//! In-memory state only advances after the new document is on disk, so a
//! failed write leaves the store at its last known-good state.

pub mod atomic;
pub mod types;

pub use types::{AuthorizedUser, NodeIdentity, PersistedState, StoreError, UserDiff, STATE_VERSION};

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{info, warn};
use uuid::Uuid;

use atomic::{persist_json, write_json_atomic};

/// Persisted node state behind the shared proxy-state lock
pub struct StateStore {
    path: PathBuf,
    state: RwLock<PersistedState>,
}

impl StateStore {
    /// Open the store at `path`, creating it from `configured` if absent.
    ///
    /// Identity fields other than the ID come from configuration on every
    /// boot so address or port changes propagate. A persisted ID always wins
    /// over a configured one.
    pub fn open(path: impl Into<PathBuf>, configured: NodeIdentity) -> Result<Self, StoreError> {
        let path = path.into();

        let state = match load(&path)? {
            Some(mut persisted) => {
                let persisted_id = persisted.identity.id.take();
                if let (Some(stored), Some(cfg)) = (&persisted_id, &configured.id) {
                    if stored != cfg {
                        warn!(
                            persisted = %stored,
                            configured = %cfg,
                            "Configured NODE_ID differs from persisted ID; keeping persisted"
                        );
                    }
                }
                let id = persisted_id.or(configured.id.clone());
                persisted.identity = NodeIdentity { id, ..configured };
                info!(
                    path = %path.display(),
                    users = persisted.users.len(),
                    registered = persisted.identity.is_registered(),
                    "Loaded node state"
                );
                persisted
            }
            None => {
                info!(path = %path.display(), "No state file, starting fresh");
                let fresh = PersistedState::new(configured);
                write_json_atomic(&path, &fresh)?;
                fresh
            }
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current node identity
    pub async fn identity(&self) -> NodeIdentity {
        self.state.read().await.identity.clone()
    }

    /// Record the control-plane assigned node ID and persist it
    pub async fn set_node_id(&self, id: &str) -> Result<(), StoreError> {
        let mut guard = self.state.write().await;
        if guard.identity.id.as_deref() == Some(id) {
            return Ok(());
        }

        let mut next = guard.clone();
        next.identity.id = Some(id.to_string());
        persist_json(&self.path, &next).await?;
        *guard = next;

        info!(node_id = %id, "Persisted node ID");
        Ok(())
    }

    /// Snapshot of the authorized set
    pub async fn authorized(&self) -> BTreeMap<Uuid, AuthorizedUser> {
        self.state.read().await.users.clone()
    }

    /// Snapshot of the authorized set, or `None` while a writer holds it
    pub fn try_authorized(&self) -> Option<BTreeMap<Uuid, AuthorizedUser>> {
        self.state.try_read().ok().map(|state| state.users.clone())
    }

    /// Take exclusive access to the authorized set for a read-modify-write
    pub async fn lock_users(&self) -> UserSetGuard<'_> {
        UserSetGuard {
            path: &self.path,
            state: self.state.write().await,
        }
    }

    /// Write the current in-memory state to disk
    pub async fn flush(&self) -> Result<(), StoreError> {
        let guard = self.state.read().await;
        persist_json(&self.path, &*guard).await
    }
}

/// Exclusive handle on the authorized-user set.
///
/// Holding one is also the permission to rewrite the proxy configuration.
pub struct UserSetGuard<'a> {
    path: &'a Path,
    state: RwLockWriteGuard<'a, PersistedState>,
}

impl UserSetGuard<'_> {
    pub fn authorized(&self) -> &BTreeMap<Uuid, AuthorizedUser> {
        &self.state.users
    }

    /// The set that would result from applying `diff`
    pub fn preview(&self, diff: &UserDiff) -> BTreeMap<Uuid, AuthorizedUser> {
        let mut users = self.state.users.clone();
        for user in &diff.to_add {
            users.insert(user.id, user.clone());
        }
        for id in &diff.to_remove {
            users.remove(id);
        }
        users
    }

    /// Persist `diff` atomically, then advance the in-memory set.
    ///
    /// An empty diff is a no-op and performs no write.
    pub async fn apply_diff(&mut self, diff: &UserDiff) -> Result<(), StoreError> {
        if diff.is_empty() {
            return Ok(());
        }

        let mut next = self.state.clone();
        next.apply(diff);
        persist_json(self.path, &next).await?;
        *self.state = next;
        Ok(())
    }
}

fn load(path: &Path) -> Result<Option<PersistedState>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let state: PersistedState = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    if state.version > STATE_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: state.version,
        });
    }

    Ok(Some(state))
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub fn identity() -> NodeIdentity {
        NodeIdentity {
            id: None,
            name: "Test Node".to_string(),
            hostname: "edge-1.example.net".to_string(),
            ip_address: "203.0.113.10".to_string(),
            port: 443,
            country: "Netherlands".to_string(),
            country_code: "NL".to_string(),
            city: Some("Amsterdam".to_string()),
            public_key: Some("pubkey".to_string()),
            short_id: Some("abcd".to_string()),
            sni: "vk.com".to_string(),
            api_url: "http://127.0.0.1:10085".to_string(),
        }
    }

    pub fn user(n: u128) -> AuthorizedUser {
        AuthorizedUser {
            id: Uuid::from_u128(n),
            label: format!("user-{}", n),
            active: true,
            quota_bytes: None,
        }
    }
}
