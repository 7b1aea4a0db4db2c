//! Node Agents
//!
//! One module per reconciliation concern. Registration runs once at boot;
//! the rest implement [`crate::scheduler::Reconciler`] and run on their own
//! timers.

pub mod health;
pub mod registration;
pub mod traffic;
pub mod user_sync;

pub use health::{HealthReporter, HostMetrics, HostSample, SysinfoMetrics};
pub use registration::{Registrar, RegistrationError};
pub use traffic::{CounterState, TrafficSync};
pub use user_sync::{SyncMechanism, SyncReport, UserSync, UserSyncError};
