//! Supervisor
//!
//! Owns the agent lifecycle: register, start the periodic loops on
//! staggered timers, wait for shutdown, drain in-flight ticks within the
//! grace window and flush the store.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agents::{
    HealthReporter, HostMetrics, Registrar, RegistrationError, SysinfoMetrics, TrafficSync, UserSync,
};
use crate::config::AgentConfig;
use crate::control_plane::{ControlPlane, HttpControlPlane};
use crate::proxy::{CommandReloader, ProxyConfigFile, ProxyControl, ProxyReloader, XrayApiClient};
use crate::retry::{BackoffPolicy, ExponentialBackoff};
use crate::scheduler::{run_once, spawn_loop, LoopSchedule, Reconciler, SyncState};
use crate::state::StateStore;

/// Start offsets so the loops do not all hit the network at once
pub const HEALTH_PHASE: Duration = Duration::ZERO;
pub const TRAFFIC_PHASE: Duration = Duration::from_secs(5);
pub const USER_SYNC_PHASE: Duration = Duration::from_secs(10);

/// Final state of one loop, reported at exit
#[derive(Debug, Clone)]
pub struct LoopSummary {
    pub name: &'static str,
    pub state: SyncState,
}

impl LoopSummary {
    pub fn failed(&self) -> bool {
        self.state.consecutive_failures > 0
    }
}

pub struct Supervisor {
    config: AgentConfig,
    control_plane: Arc<dyn ControlPlane>,
    proxy: Arc<dyn ProxyControl>,
    reloader: Arc<dyn ProxyReloader>,
    metrics: Arc<dyn HostMetrics>,
    store: Arc<StateStore>,
    backoff: Box<dyn BackoffPolicy>,
}

impl Supervisor {
    pub fn new(
        config: AgentConfig,
        control_plane: Arc<dyn ControlPlane>,
        proxy: Arc<dyn ProxyControl>,
        reloader: Arc<dyn ProxyReloader>,
        metrics: Arc<dyn HostMetrics>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            config,
            control_plane,
            proxy,
            reloader,
            metrics,
            store,
            backoff: Box::new(ExponentialBackoff::default()),
        }
    }

    /// Build a supervisor wired to the real control plane, proxy and host
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let control_plane = HttpControlPlane::new(&config.server_url, config.api_key.clone(), config.http_timeout)
            .context("Failed to create control plane client")?;

        let proxy = XrayApiClient::new(&config.xray_api_url, config.client_flow.clone(), config.http_timeout)
            .context("Failed to create proxy control client")?;

        let reloader = CommandReloader::from_command_line(&config.reload_command, config.http_timeout)
            .context("Invalid proxy reload command")?;

        if let Some(dir) = config.state_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
        }
        let store = StateStore::open(&config.state_path, config.identity.clone())
            .context("Failed to open agent state")?;

        Ok(Self::new(
            config,
            Arc::new(control_plane),
            Arc::new(proxy),
            Arc::new(reloader),
            Arc::new(SysinfoMetrics::new()),
            Arc::new(store),
        ))
    }

    pub fn with_backoff(mut self, backoff: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Box::new(backoff);
        self
    }

    /// Run until `shutdown` resolves (or, with `once`, after one pass).
    ///
    /// Fails only when the control plane rejects the registration secret.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<Vec<LoopSummary>> {
        let cancel = CancellationToken::new();
        tokio::pin!(shutdown);

        let registrar = Registrar::new(self.control_plane.clone(), self.store.clone());
        let registered = {
            let registration = registrar.run(self.backoff.as_ref(), &cancel);
            tokio::pin!(registration);

            // An in-flight register call is allowed to finish so an assigned
            // ID is never dropped on the floor
            tokio::select! {
                result = &mut registration => result,
                _ = &mut shutdown => {
                    info!("Shutdown requested during registration");
                    cancel.cancel();
                    registration.await
                }
            }
        };

        let node_id = match registered {
            Ok(id) if !cancel.is_cancelled() => id,
            Ok(_) | Err(RegistrationError::Cancelled) => {
                self.flush_store().await;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e).context("Node registration failed"),
        };

        let reconcilers = self.reconcilers(&node_id);

        let summaries = if self.config.once {
            self.run_single_pass(&reconcilers).await
        } else {
            self.run_loops(reconcilers, cancel, shutdown).await
        };

        self.flush_store().await;
        for summary in &summaries {
            info!(
                loop_name = summary.name,
                runs = summary.state.runs,
                consecutive_failures = summary.state.consecutive_failures,
                last_success = ?summary.state.last_success,
                last_error = ?summary.state.last_error,
                "Loop summary"
            );
        }
        Ok(summaries)
    }

    fn reconcilers(&self, node_id: &str) -> Vec<(Arc<dyn Reconciler>, LoopSchedule)> {
        let intervals = self.config.intervals;

        let health = HealthReporter::new(
            self.control_plane.clone(),
            self.proxy.clone(),
            self.metrics.clone(),
            node_id,
            self.config.inbound_tag.clone(),
        );

        let traffic = TrafficSync::new(
            self.control_plane.clone(),
            self.proxy.clone(),
            self.store.clone(),
            node_id,
        );

        let config_file = ProxyConfigFile::new(
            self.config.xray_config_path.clone(),
            self.config.inbound_tag.clone(),
            self.config.client_flow.clone(),
        );
        let user_sync = UserSync::new(
            self.control_plane.clone(),
            self.proxy.clone(),
            config_file,
            self.reloader.clone(),
            self.store.clone(),
            node_id,
            self.config.inbound_tag.clone(),
        );

        vec![
            (
                Arc::new(health) as Arc<dyn Reconciler>,
                LoopSchedule {
                    interval: intervals.health,
                    phase: HEALTH_PHASE,
                },
            ),
            (
                Arc::new(traffic) as Arc<dyn Reconciler>,
                LoopSchedule {
                    interval: intervals.traffic,
                    phase: TRAFFIC_PHASE,
                },
            ),
            (
                Arc::new(user_sync) as Arc<dyn Reconciler>,
                LoopSchedule {
                    interval: intervals.user_sync,
                    phase: USER_SYNC_PHASE,
                },
            ),
        ]
    }

    async fn run_single_pass(&self, reconcilers: &[(Arc<dyn Reconciler>, LoopSchedule)]) -> Vec<LoopSummary> {
        info!("Running one pass of every loop");
        let mut summaries = Vec::with_capacity(reconcilers.len());
        for (reconciler, _) in reconcilers {
            let state = run_once(reconciler.as_ref()).await;
            summaries.push(LoopSummary {
                name: reconciler.name(),
                state,
            });
        }
        summaries
    }

    async fn run_loops<S>(
        &self,
        reconcilers: Vec<(Arc<dyn Reconciler>, LoopSchedule)>,
        cancel: CancellationToken,
        shutdown: S,
    ) -> Vec<LoopSummary>
    where
        S: Future<Output = ()>,
    {
        let handles: Vec<_> = reconcilers
            .into_iter()
            .map(|(reconciler, schedule)| spawn_loop(reconciler, schedule, cancel.child_token()))
            .collect();

        info!(loops = handles.len(), "Node agent running");
        shutdown.await;
        info!(
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Shutdown requested, draining loops"
        );
        cancel.cancel();

        let mut states = Vec::with_capacity(handles.len());
        let mut tasks = Vec::with_capacity(handles.len());
        let mut aborts = Vec::with_capacity(handles.len());
        for handle in handles {
            states.push((handle.name, handle.state));
            aborts.push(handle.task.abort_handle());
            tasks.push(handle.task);
        }

        match tokio::time::timeout(self.config.shutdown_grace, join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Loop task ended abnormally");
                    }
                }
            }
            Err(_) => {
                warn!("Loops did not drain within the grace period, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        states
            .into_iter()
            .map(|(name, rx)| LoopSummary {
                name,
                state: rx.borrow().clone(),
            })
            .collect()
    }

    async fn flush_store(&self) {
        if let Err(e) = self.store.flush().await {
            error!(path = %self.store.path().display(), error = %e, "Failed to flush state at shutdown");
        }
    }
}
