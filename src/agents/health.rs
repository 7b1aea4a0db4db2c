//! Health Reporting
//!
//! Pure telemetry: host CPU and memory plus the proxy's open connection
//! count, posted every interval. A missed report is superseded by the next.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use sysinfo::{System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlane, HealthReport};
use crate::proxy::ProxyControl;
use crate::scheduler::Reconciler;

/// Host resource usage in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of host resource usage
pub trait HostMetrics: Send + Sync {
    fn sample(&self) -> HostSample;
}

/// sysinfo-backed host metrics.
///
/// CPU usage is measured between consecutive refreshes, so the `System` is
/// kept across ticks. Construction blocks for one minimum CPU update
/// interval so the first sample already covers a real window.
pub struct SysinfoMetrics {
    system: Mutex<System>,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetrics for SysinfoMetrics {
    fn sample(&self) -> HostSample {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        HostSample {
            cpu_percent: system.global_cpu_usage().clamp(0.0, 100.0),
            memory_percent,
        }
    }
}

pub struct HealthReporter {
    control_plane: Arc<dyn ControlPlane>,
    proxy: Arc<dyn ProxyControl>,
    metrics: Arc<dyn HostMetrics>,
    node_id: String,
    inbound_tag: String,
}

impl HealthReporter {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        proxy: Arc<dyn ProxyControl>,
        metrics: Arc<dyn HostMetrics>,
        node_id: impl Into<String>,
        inbound_tag: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            proxy,
            metrics,
            node_id: node_id.into(),
            inbound_tag: inbound_tag.into(),
        }
    }

    /// Gather one report. Never fails: an unreachable proxy is itself health data.
    pub async fn gather(&self) -> HealthReport {
        let host = self.metrics.sample();

        let active_connections = match self.proxy.active_connections(&self.inbound_tag).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Proxy stats unavailable for health report");
                None
            }
        };

        HealthReport {
            node_id: self.node_id.clone(),
            cpu_usage: host.cpu_percent,
            memory_usage: host.memory_percent,
            active_connections,
            is_healthy: active_connections.is_some(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl Reconciler for HealthReporter {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn tick(&self) -> Result<()> {
        let report = self.gather().await;
        debug!(?report, "Sending health report");

        self.control_plane
            .send_health(&report)
            .await
            .context("health report rejected")?;

        info!(
            cpu = report.cpu_usage,
            memory = report.memory_usage,
            connections = ?report.active_connections,
            healthy = report.is_healthy,
            "Health report sent"
        );
        Ok(())
    }
}
