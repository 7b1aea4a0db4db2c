//! Proxy Control Client
//!
//! Two ways to change the proxy's credential set:
//!
//! - **API** ([`ProxyControl`]): live add/remove, no restart
//! - **Config reload** ([`ProxyConfigFile`] + [`ProxyReloader`]): rewrite the
//!   persisted configuration and restart the proxy; only used when the API
//!   reports [`ProxyError::CapabilityUnavailable`]

mod client;
pub mod config_file;
mod reload;
pub mod types;

pub use client::{proxy_client, ProxyControl, XrayApiClient};
pub use config_file::{ClientsRewrite, ProxyConfigFile};
pub use reload::{CommandReloader, ProxyReloader};
pub use types::{ProxyClient, ProxyError, UserCounters};
