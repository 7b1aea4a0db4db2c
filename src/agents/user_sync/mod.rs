//! User Sync
//!
//! Level-triggered reconciliation of the proxy's credential set against the
//! control plane. Each tick fetches the authoritative list, diffs it against
//! the local authorized set and applies the difference:
//!
//! 1. additions, then removals, through the live proxy control API
//! 2. if the API reports itself unavailable, everything left in the tick is
//!    applied by regenerating the proxy config and reloading once
//! 3. successful changes are recorded in the store in one atomic write
//!
//! Credentials that fail for any other reason stay out of the store and show
//! up in the next tick's diff.

pub mod diff;
pub mod types;

pub use diff::compute_diff;
pub use types::{ChangeKind, CredentialFailure, SyncMechanism, SyncReport, UserSyncError};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlane;
use crate::proxy::{ProxyConfigFile, ProxyControl, ProxyError, ProxyReloader};
use crate::scheduler::Reconciler;
use crate::state::{StateStore, UserDiff, UserSetGuard};

pub struct UserSync {
    control_plane: Arc<dyn ControlPlane>,
    proxy: Arc<dyn ProxyControl>,
    config_file: ProxyConfigFile,
    reloader: Arc<dyn ProxyReloader>,
    store: Arc<StateStore>,
    node_id: String,
    inbound_tag: String,
}

/// Changes split by how they were (or will be) applied
#[derive(Default)]
struct Plan {
    via_api: UserDiff,
    deferred: UserDiff,
    failed: Vec<CredentialFailure>,
    api_available: bool,
}

impl Plan {
    fn new() -> Self {
        Self {
            api_available: true,
            ..Default::default()
        }
    }

    fn api_unavailable(&mut self, error: &ProxyError) {
        if self.api_available {
            warn!(error = %error, "Proxy control API unavailable, falling back to config reload for this tick");
        }
        self.api_available = false;
    }
}

impl UserSync {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        proxy: Arc<dyn ProxyControl>,
        config_file: ProxyConfigFile,
        reloader: Arc<dyn ProxyReloader>,
        store: Arc<StateStore>,
        node_id: impl Into<String>,
        inbound_tag: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            proxy,
            config_file,
            reloader,
            store,
            node_id: node_id.into(),
            inbound_tag: inbound_tag.into(),
        }
    }

    /// Run one read-diff-apply cycle under the user-set lock
    pub async fn reconcile(&self) -> Result<SyncReport, UserSyncError> {
        let remote = self.control_plane.fetch_users(&self.node_id).await?;

        let mut guard = self.store.lock_users().await;
        let diff = compute_diff(guard.authorized(), &remote);

        if diff.is_empty() {
            debug!(users = guard.authorized().len(), "Authorized set already in sync");
            return Ok(SyncReport::unchanged(guard.authorized().len()));
        }

        info!(
            to_add = diff.to_add.len(),
            to_remove = diff.to_remove.len(),
            "Reconciling authorized users"
        );

        let mut plan = Plan::new();
        self.apply_via_api(&diff, &mut plan).await;

        let mut reloaded = false;
        if !plan.deferred.is_empty() {
            let fallback = self.apply_via_config(&guard, &plan).await;
            if let Err(e) = fallback {
                // The API-applied part is live on the proxy; keep the record honest
                guard.apply_diff(&plan.via_api).await?;
                return Err(UserSyncError::Fallback(e));
            }
            reloaded = true;
        }

        let via_api = plan.via_api.len();
        let via_config = plan.deferred.len();

        let mut applied = plan.via_api.clone();
        applied.extend(plan.deferred.clone());
        guard.apply_diff(&applied).await?;

        if via_config == 0 && via_api > 0 {
            reloaded = self.mirror_config(&guard).await;
        }

        Ok(SyncReport {
            added: applied.to_add.len(),
            removed: applied.to_remove.len(),
            failed: plan.failed,
            total: guard.authorized().len(),
            mechanism: SyncMechanism::from_counts(via_api, via_config),
            reloaded,
        })
    }

    /// Additions first, then removals. The first capability error defers
    /// everything not yet attempted to the config path.
    async fn apply_via_api(&self, diff: &UserDiff, plan: &mut Plan) {
        for user in &diff.to_add {
            if !plan.api_available {
                plan.deferred.to_add.push(user.clone());
                continue;
            }
            match self.proxy.add_user(&self.inbound_tag, user).await {
                Ok(()) => {
                    debug!(user = %user.id, "Added user via API");
                    plan.via_api.to_add.push(user.clone());
                }
                Err(e) if e.is_capability_unavailable() => {
                    plan.api_unavailable(&e);
                    plan.deferred.to_add.push(user.clone());
                }
                Err(e) => {
                    warn!(user = %user.id, error = %e, "Failed to add user");
                    plan.failed.push(CredentialFailure {
                        id: user.id,
                        change: ChangeKind::Add,
                        error: e.to_string(),
                    });
                }
            }
        }

        for id in &diff.to_remove {
            if !plan.api_available {
                plan.deferred.to_remove.push(*id);
                continue;
            }
            match self.proxy.remove_user(&self.inbound_tag, id).await {
                Ok(()) => {
                    debug!(user = %id, "Removed user via API");
                    plan.via_api.to_remove.push(*id);
                }
                Err(e) if e.is_capability_unavailable() => {
                    plan.api_unavailable(&e);
                    plan.deferred.to_remove.push(*id);
                }
                Err(e) => {
                    warn!(user = %id, error = %e, "Failed to remove user");
                    plan.failed.push(CredentialFailure {
                        id: *id,
                        change: ChangeKind::Remove,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Keep the on-disk config in step with an API-applied change so a proxy
    /// restart comes back with the same credentials.
    ///
    /// Entries whose `email` was not their credential ID are live under the
    /// old email, where stats and removals cannot reach them, so relabeling
    /// any forces a reload. Returns whether the proxy was reloaded.
    async fn mirror_config(&self, guard: &UserSetGuard<'_>) -> bool {
        let rewrite = match self.config_file.sync_clients(guard, guard.authorized()).await {
            Ok(rewrite) => rewrite,
            Err(e) => {
                warn!(
                    path = %self.config_file.path().display(),
                    error = %e,
                    "Failed to mirror authorized users into proxy config"
                );
                return false;
            }
        };

        if rewrite.relabeled == 0 {
            return false;
        }

        info!(relabeled = rewrite.relabeled, "Proxy clients relabeled to credential IDs, reloading");
        match self.reloader.reload().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Reload after relabeling proxy clients failed");
                false
            }
        }
    }

    /// Rewrite the config for the post-tick set and reload once.
    ///
    /// Reloads even when the file already matches: a previous tick may have
    /// written it and then failed to reload.
    async fn apply_via_config(&self, guard: &UserSetGuard<'_>, plan: &Plan) -> Result<(), ProxyError> {
        let mut combined = plan.via_api.clone();
        combined.extend(plan.deferred.clone());
        let target = guard.preview(&combined);

        let rewrite = self.config_file.sync_clients(guard, &target).await?;
        debug!(
            changed = rewrite.changed,
            clients = target.len(),
            "Proxy config regenerated"
        );

        self.reloader.reload().await
    }
}

#[async_trait]
impl Reconciler for UserSync {
    fn name(&self) -> &'static str {
        "user_sync"
    }

    async fn tick(&self) -> Result<()> {
        let report = match self.reconcile().await {
            Ok(report) => report,
            // Keep the control plane error reachable for auth classification
            Err(UserSyncError::ControlPlane(e)) => {
                return Err(anyhow::Error::new(e).context("failed to fetch authorized users"))
            }
            Err(e) => return Err(e.into()),
        };

        if report.mechanism != SyncMechanism::None || !report.is_clean() {
            info!(
                added = report.added,
                removed = report.removed,
                failed = report.failed.len(),
                total = report.total,
                mechanism = %report.mechanism,
                reloaded = report.reloaded,
                "User sync complete"
            );
        }

        if !report.is_clean() {
            anyhow::bail!(
                "{} credential change(s) failed and will be retried",
                report.failed.len()
            );
        }
        Ok(())
    }
}
