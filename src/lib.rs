//! Fleet Node Agent Library
//!
//! Keeps one edge node's proxy (Xray) in step with the central control plane:
//! registration, health telemetry, traffic accounting and the authorized-user
//! reconciliation loop.

pub mod agents;
pub mod config;
pub mod control_plane;
pub mod proxy;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod supervisor;

pub use config::{AgentArgs, AgentConfig, ConfigError};
pub use control_plane::{ControlPlane, ControlPlaneError, HttpControlPlane};
pub use proxy::{CommandReloader, ProxyConfigFile, ProxyControl, ProxyError, ProxyReloader, XrayApiClient};
pub use state::{AuthorizedUser, NodeIdentity, StateStore, StoreError, UserDiff};
pub use supervisor::{LoopSummary, Supervisor};
