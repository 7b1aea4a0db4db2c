//! Per-loop scheduler
//!
//! Every reconciler runs in its own task with its own interval timer. Ticks
//! run inline in that task, so a loop never overlaps itself; ticks missed
//! while a slow one was running are skipped, not queued.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control_plane::ControlPlaneError;

/// One single-purpose reconciliation step
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one tick. Errors are recorded and retried at the next tick.
    async fn tick(&self) -> Result<()>;
}

/// Observability state of one loop. Rebuilt on every start.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub runs: u64,
}

impl SyncState {
    fn record(&mut self, outcome: &Result<()>) {
        self.runs += 1;
        match outcome {
            Ok(()) => {
                self.last_success = Some(Utc::now());
                self.last_error = None;
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.last_error = Some(format!("{:#}", e));
                self.consecutive_failures += 1;
            }
        }
    }
}

/// Timer settings for one loop
#[derive(Debug, Clone, Copy)]
pub struct LoopSchedule {
    pub interval: Duration,
    /// Delay before the first tick, used to stagger loops
    pub phase: Duration,
}

/// A running loop
pub struct LoopHandle {
    pub name: &'static str,
    pub state: watch::Receiver<SyncState>,
    pub task: JoinHandle<()>,
}

/// Spawn `reconciler` on its own timer until `cancel` fires
pub fn spawn_loop(
    reconciler: Arc<dyn Reconciler>,
    schedule: LoopSchedule,
    cancel: CancellationToken,
) -> LoopHandle {
    let name = reconciler.name();
    let (tx, rx) = watch::channel(SyncState::default());

    let task = tokio::spawn(async move {
        run_loop(reconciler, schedule, cancel, tx).await;
    });

    LoopHandle {
        name,
        state: rx,
        task,
    }
}

async fn run_loop(
    reconciler: Arc<dyn Reconciler>,
    schedule: LoopSchedule,
    cancel: CancellationToken,
    state: watch::Sender<SyncState>,
) {
    let name = reconciler.name();

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = sleep(schedule.phase) => {}
    }

    info!(
        loop_name = name,
        interval_secs = schedule.interval.as_secs(),
        "Starting loop"
    );

    let mut ticker = interval(schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // An in-flight tick is never interrupted; every call in it is bounded
        let outcome = reconciler.tick().await;
        log_outcome(name, &outcome, state.borrow().consecutive_failures);
        state.send_modify(|s| s.record(&outcome));
    }

    debug!(loop_name = name, "Loop stopped");
}

/// Run a single tick outside any timer (used by `--once`)
pub async fn run_once(reconciler: &dyn Reconciler) -> SyncState {
    let mut state = SyncState::default();
    let outcome = reconciler.tick().await;
    log_outcome(reconciler.name(), &outcome, 0);
    state.record(&outcome);
    state
}

fn log_outcome(name: &'static str, outcome: &Result<()>, previous_failures: u32) {
    let Err(e) = outcome else {
        return;
    };

    let auth = e
        .downcast_ref::<ControlPlaneError>()
        .map(ControlPlaneError::is_auth)
        .unwrap_or(false);

    if auth {
        error!(
            loop_name = name,
            consecutive_failures = previous_failures + 1,
            error = %format!("{:#}", e),
            "Control plane rejected credentials; check NODE_API_KEY"
        );
    } else {
        warn!(
            loop_name = name,
            consecutive_failures = previous_failures + 1,
            error = %format!("{:#}", e),
            "Tick failed, retrying next interval"
        );
    }
}
