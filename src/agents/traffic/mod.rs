//! Traffic Sync
//!
//! Reads the proxy's cumulative per-user byte counters (never resetting
//! them), turns them into deltas with [`CounterState`] and reports them in
//! one batch. Baselines only advance once the control plane confirms the
//! batch, so a failed report is folded into the next one.
//!
//! Counters are keyed by the proxy's client email, which the agent always
//! sets to the credential ID. Stats under any other email are not reported.

pub mod counter;

pub use counter::CounterState;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control_plane::{ControlPlane, TrafficRecord, TrafficReport};
use crate::proxy::ProxyControl;
use crate::scheduler::Reconciler;
use crate::state::StateStore;

/// Uplink and downlink state for one credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialCounters {
    pub uplink: CounterState,
    pub downlink: CounterState,
}

impl CredentialCounters {
    fn pending(&self) -> (u64, u64) {
        (self.uplink.pending(), self.downlink.pending())
    }

    fn commit(&mut self) {
        self.uplink.commit();
        self.downlink.commit();
    }
}

pub struct TrafficSync {
    control_plane: Arc<dyn ControlPlane>,
    proxy: Arc<dyn ProxyControl>,
    store: Arc<StateStore>,
    node_id: String,
    trackers: Mutex<HashMap<Uuid, CredentialCounters>>,
}

impl TrafficSync {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        proxy: Arc<dyn ProxyControl>,
        store: Arc<StateStore>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            proxy,
            store,
            node_id: node_id.into(),
            trackers: Mutex::new(HashMap::new()),
        }
    }

    fn trackers(&self) -> MutexGuard<'_, HashMap<Uuid, CredentialCounters>> {
        match self.trackers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current per-credential tracking state
    pub fn snapshot(&self) -> BTreeMap<Uuid, CredentialCounters> {
        self.trackers().iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Records with a non-zero pending amount, sorted by credential
    fn pending_records(trackers: &HashMap<Uuid, CredentialCounters>) -> Vec<(Uuid, TrafficRecord)> {
        let mut records: Vec<(Uuid, TrafficRecord)> = trackers
            .iter()
            .filter_map(|(credential, counters)| {
                let (upload, download) = counters.pending();
                (upload > 0 || download > 0).then(|| {
                    let record = TrafficRecord {
                        credential_id: credential.to_string(),
                        upload,
                        download,
                    };
                    (*credential, record)
                })
            })
            .collect();
        records.sort_by_key(|(credential, _)| *credential);
        records
    }
}

#[async_trait]
impl Reconciler for TrafficSync {
    fn name(&self) -> &'static str {
        "traffic"
    }

    async fn tick(&self) -> Result<()> {
        let counters = self
            .proxy
            .user_counters()
            .await
            .context("failed to query proxy traffic counters")?;

        let mut seen = HashSet::with_capacity(counters.len());
        let mut unmapped = 0usize;
        let pending = {
            let mut trackers = self.trackers();
            for (email, raw) in &counters {
                let Ok(credential) = Uuid::parse_str(email) else {
                    unmapped += 1;
                    continue;
                };
                seen.insert(credential);
                let entry = trackers.entry(credential).or_default();
                entry.uplink.observe(raw.uplink);
                entry.downlink.observe(raw.downlink);
            }
            Self::pending_records(&trackers)
        };

        if unmapped > 0 {
            warn!(unmapped, "Ignoring proxy stats whose email is not a credential ID");
        }

        if pending.is_empty() {
            debug!(credentials = counters.len(), "No new traffic to report");
        } else {
            let (credentials, records): (Vec<Uuid>, Vec<TrafficRecord>) = pending.into_iter().unzip();
            let report = TrafficReport {
                node_id: self.node_id.clone(),
                timestamp: Utc::now(),
                records,
            };

            self.control_plane
                .send_traffic(&report)
                .await
                .context("traffic report rejected")?;

            let (upload, download) = report
                .records
                .iter()
                .fold((0u64, 0u64), |(u, d), r| (u.saturating_add(r.upload), d.saturating_add(r.download)));

            let mut trackers = self.trackers();
            for credential in &credentials {
                if let Some(counters) = trackers.get_mut(credential) {
                    counters.commit();
                }
            }

            info!(
                users = report.records.len(),
                upload_bytes = upload,
                download_bytes = download,
                "Traffic reported"
            );
        }

        // Forget credentials that vanished from both the proxy and the
        // authorized set once nothing is owed for them. User sync holds the
        // set for a whole reconcile; pruning waits for a tick where it is free.
        let Some(known) = self.store.try_authorized() else {
            debug!("Authorized set busy, skipping tracker pruning");
            return Ok(());
        };

        let mut trackers = self.trackers();
        trackers.retain(|credential, state| {
            let (up, down) = state.pending();
            up > 0 || down > 0 || seen.contains(credential) || known.contains_key(credential)
        });

        Ok(())
    }
}
