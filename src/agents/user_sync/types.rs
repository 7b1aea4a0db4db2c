//! User Sync Types

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::control_plane::ControlPlaneError;
use crate::proxy::ProxyError;
use crate::state::StoreError;

/// How a tick changed the proxy's live credential set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMechanism {
    /// Nothing was applied
    None,
    /// Live changes through the control API only
    Api,
    /// Config file rewrite plus reload only
    ConfigReload,
    /// Some changes via the API before it became unavailable
    Mixed,
}

impl SyncMechanism {
    pub(crate) fn from_counts(via_api: usize, via_config: usize) -> Self {
        match (via_api > 0, via_config > 0) {
            (false, false) => SyncMechanism::None,
            (true, false) => SyncMechanism::Api,
            (false, true) => SyncMechanism::ConfigReload,
            (true, true) => SyncMechanism::Mixed,
        }
    }
}

impl std::fmt::Display for SyncMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMechanism::None => write!(f, "none"),
            SyncMechanism::Api => write!(f, "api"),
            SyncMechanism::ConfigReload => write!(f, "config-reload"),
            SyncMechanism::Mixed => write!(f, "mixed"),
        }
    }
}

/// Per-credential failure within a tick
#[derive(Debug, Clone, Serialize)]
pub struct CredentialFailure {
    pub id: Uuid,
    pub change: ChangeKind,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Remove,
}

/// Outcome of one user sync tick
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    pub failed: Vec<CredentialFailure>,
    /// Authorized users after the tick
    pub total: usize,
    pub mechanism: SyncMechanism,
    /// Whether the proxy was restarted to pick up a rewritten config
    pub reloaded: bool,
}

impl SyncReport {
    pub fn unchanged(total: usize) -> Self {
        Self {
            added: 0,
            removed: 0,
            failed: Vec::new(),
            total,
            mechanism: SyncMechanism::None,
            reloaded: false,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Failures that abort a whole user sync tick
#[derive(Debug, Error)]
pub enum UserSyncError {
    #[error("failed to fetch authorized users: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    /// The proxy changed but the local record could not be written; the
    /// next tick re-derives the same diff and converges
    #[error("failed to record applied changes: {0}")]
    Store(#[from] StoreError),

    /// The config fallback could not be written or the reload failed
    #[error("config fallback failed: {0}")]
    Fallback(#[source] ProxyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_from_counts() {
        assert_eq!(SyncMechanism::from_counts(0, 0), SyncMechanism::None);
        assert_eq!(SyncMechanism::from_counts(3, 0), SyncMechanism::Api);
        assert_eq!(SyncMechanism::from_counts(0, 1), SyncMechanism::ConfigReload);
        assert_eq!(SyncMechanism::from_counts(1, 1), SyncMechanism::Mixed);
    }

    #[test]
    fn test_mechanism_display_matches_serde() {
        for mechanism in [
            SyncMechanism::None,
            SyncMechanism::Api,
            SyncMechanism::ConfigReload,
            SyncMechanism::Mixed,
        ] {
            let json = serde_json::to_string(&mechanism).unwrap();
            assert_eq!(json.trim_matches('"'), mechanism.to_string());
        }
    }
}
