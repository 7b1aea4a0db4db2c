//! Agent configuration
//!
//! Every setting is a CLI flag with an environment variable fallback, so the
//! agent runs unchanged under systemd, docker or cron.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::state::NodeIdentity;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must not be empty")]
    Empty { name: &'static str },

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("{name} is not a valid URL ({value}): {reason}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Fleet node agent
#[derive(Parser, Debug, Clone)]
#[command(name = "node-agent", version, about)]
pub struct AgentArgs {
    /// Control plane node API base URL
    #[arg(long, env = "MAIN_SERVER_URL", default_value = "http://localhost:8000/api/v1/nodes")]
    pub server_url: String,

    /// Shared secret sent as a bearer token
    #[arg(long, env = "NODE_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Operator-assigned node ID (a persisted ID always wins)
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,

    #[arg(long, env = "NODE_NAME", default_value = "Default Node")]
    pub node_name: String,

    #[arg(long, env = "NODE_HOSTNAME", default_value = "localhost")]
    pub hostname: String,

    /// Public address clients connect to
    #[arg(long, env = "NODE_IP", default_value = "0.0.0.0")]
    pub ip_address: String,

    #[arg(long, env = "NODE_PORT", default_value_t = 443)]
    pub port: u16,

    #[arg(long, env = "NODE_COUNTRY", default_value = "RU")]
    pub country: String,

    #[arg(long, env = "NODE_COUNTRY_CODE", default_value = "RU")]
    pub country_code: String,

    #[arg(long, env = "NODE_CITY")]
    pub city: Option<String>,

    /// Reality public key advertised to clients
    #[arg(long, env = "REALITY_PUBLIC_KEY")]
    pub public_key: Option<String>,

    #[arg(long, env = "REALITY_SHORT_ID")]
    pub short_id: Option<String>,

    /// Masquerade server name
    #[arg(long, env = "NODE_SNI", default_value = "vk.com")]
    pub sni: String,

    /// Proxy control API address advertised at registration
    #[arg(long, env = "NODE_ADVERTISED_API_URL", default_value = "http://node-agent:10085")]
    pub advertised_api_url: String,

    /// Traffic sync interval in seconds
    #[arg(long, env = "SYNC_INTERVAL", default_value_t = 30)]
    pub sync_interval: u64,

    /// Health report interval in seconds
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value_t = 60)]
    pub health_interval: u64,

    /// User sync interval in seconds
    #[arg(long, env = "USER_SYNC_INTERVAL", default_value_t = 60)]
    pub user_sync_interval: u64,

    /// Local proxy control API
    #[arg(long, env = "XRAY_API_URL", default_value = "http://127.0.0.1:10085")]
    pub xray_api_url: String,

    /// Proxy configuration file rewritten by the reload fallback
    #[arg(long, env = "XRAY_CONFIG_PATH", default_value = "/usr/local/etc/xray/config.json")]
    pub xray_config_path: PathBuf,

    /// Tag of the managed inbound
    #[arg(long, env = "XRAY_INBOUND_TAG", default_value = "vless-in")]
    pub inbound_tag: String,

    /// Client flow; empty for none (required by XHTTP transport)
    #[arg(long, env = "XRAY_CLIENT_FLOW", default_value = "xtls-rprx-vision")]
    pub client_flow: String,

    /// Command that makes the proxy re-read its configuration
    #[arg(long, env = "XRAY_RELOAD_COMMAND", default_value = "systemctl restart xray")]
    pub reload_command: String,

    /// Persisted agent state
    #[arg(long, env = "STATE_PATH", default_value = "/var/lib/node-agent/state.json")]
    pub state_path: PathBuf,

    /// Timeout for every outbound call and the reload command, in seconds
    #[arg(long, env = "HTTP_TIMEOUT", default_value_t = 10)]
    pub http_timeout: u64,

    /// Time allowed for in-flight ticks at shutdown, in seconds
    #[arg(long, env = "SHUTDOWN_GRACE", default_value_t = 15)]
    pub shutdown_grace: u64,

    /// Register, run one tick of every loop, then exit (for cron)
    #[arg(long, default_value = "false")]
    pub once: bool,

    /// Emit JSON logs
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Loop intervals and start offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub health: Duration,
    pub traffic: Duration,
    pub user_sync: Duration,
}

/// Validated agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub api_key: String,
    pub identity: NodeIdentity,
    pub intervals: Intervals,
    pub xray_api_url: String,
    pub xray_config_path: PathBuf,
    pub inbound_tag: String,
    pub client_flow: Option<String>,
    pub reload_command: String,
    pub state_path: PathBuf,
    pub http_timeout: Duration,
    pub shutdown_grace: Duration,
    pub once: bool,
}

impl AgentConfig {
    pub fn from_args(args: AgentArgs) -> Result<Self, ConfigError> {
        non_empty("NODE_API_KEY", &args.api_key)?;
        non_empty("XRAY_INBOUND_TAG", &args.inbound_tag)?;
        non_empty("XRAY_RELOAD_COMMAND", &args.reload_command)?;
        valid_url("MAIN_SERVER_URL", &args.server_url)?;
        valid_url("XRAY_API_URL", &args.xray_api_url)?;

        let intervals = Intervals {
            health: seconds("HEALTH_CHECK_INTERVAL", args.health_interval)?,
            traffic: seconds("SYNC_INTERVAL", args.sync_interval)?,
            user_sync: seconds("USER_SYNC_INTERVAL", args.user_sync_interval)?,
        };

        let identity = NodeIdentity {
            id: args.node_id.filter(|id| !id.trim().is_empty()),
            name: args.node_name,
            hostname: args.hostname,
            ip_address: args.ip_address,
            port: args.port,
            country: args.country,
            country_code: args.country_code,
            city: args.city.filter(|c| !c.is_empty()),
            public_key: args.public_key.filter(|k| !k.is_empty()),
            short_id: args.short_id.filter(|s| !s.is_empty()),
            sni: args.sni,
            api_url: args.advertised_api_url,
        };

        Ok(Self {
            server_url: args.server_url,
            api_key: args.api_key,
            identity,
            intervals,
            xray_api_url: args.xray_api_url,
            xray_config_path: args.xray_config_path,
            inbound_tag: args.inbound_tag,
            client_flow: Some(args.client_flow).filter(|f| !f.is_empty()),
            reload_command: args.reload_command,
            state_path: args.state_path,
            http_timeout: seconds("HTTP_TIMEOUT", args.http_timeout)?,
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            once: args.once,
        })
    }
}

fn non_empty(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty { name });
    }
    Ok(())
}

fn seconds(name: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroDuration { name });
    }
    Ok(Duration::from_secs(value))
}

fn valid_url(name: &'static str, value: &str) -> Result<(), ConfigError> {
    reqwest::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidUrl {
            name,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> AgentArgs {
        let mut argv = vec!["node-agent", "--api-key", "secret"];
        argv.extend_from_slice(extra);
        AgentArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_args(parse(&[])).unwrap();

        assert_eq!(config.intervals.traffic, Duration::from_secs(30));
        assert_eq!(config.intervals.health, Duration::from_secs(60));
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_grace, Duration::from_secs(15));
        assert_eq!(config.identity.sni, "vk.com");
        assert_eq!(config.client_flow.as_deref(), Some("xtls-rprx-vision"));
        assert!(config.identity.id.is_none());
        assert!(!config.once);
    }

    #[test]
    fn test_empty_flow_means_none() {
        let config = AgentConfig::from_args(parse(&["--client-flow", ""])).unwrap();
        assert!(config.client_flow.is_none());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = AgentConfig::from_args(parse(&["--sync-interval", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration { name: "SYNC_INTERVAL" }));
    }

    #[test]
    fn test_bad_url_rejected() {
        let err = AgentConfig::from_args(parse(&["--server-url", "not a url"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn test_blank_secret_rejected() {
        let args = AgentArgs::try_parse_from(["node-agent", "--api-key", "  "]).unwrap();
        assert!(matches!(
            AgentConfig::from_args(args),
            Err(ConfigError::Empty { name: "NODE_API_KEY" })
        ));
    }

    #[test]
    fn test_preseeded_node_id() {
        let config = AgentConfig::from_args(parse(&["--node-id", "node-7"])).unwrap();
        assert_eq!(config.identity.id.as_deref(), Some("node-7"));
    }
}
