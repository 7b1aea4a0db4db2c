//! Proxy reload signal
//!
//! Used only after the config-file fallback. Connections of other users may
//! drop for a few seconds while the proxy restarts.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::types::ProxyError;

#[async_trait]
pub trait ProxyReloader: Send + Sync {
    /// Make the proxy pick up its configuration file
    async fn reload(&self) -> Result<(), ProxyError>;
}

/// Reloads the proxy by running an external command (e.g. `systemctl restart xray`)
pub struct CommandReloader {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandReloader {
    /// Parse a whitespace-separated command line
    pub fn from_command_line(command: &str, timeout: Duration) -> Result<Self, ProxyError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| ProxyError::Reload {
            command: command.to_string(),
            reason: "empty reload command".to_string(),
        })?;

        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl ProxyReloader for CommandReloader {
    async fn reload(&self) -> Result<(), ProxyError> {
        let command = self.command_line();
        info!(command = %command, "Reloading proxy");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ProxyError::Reload {
            command: command.clone(),
            reason: format!("timed out after {:?}", self.timeout),
        })?
        .map_err(|e| ProxyError::Reload {
            command: command.clone(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(command = %command, status = %output.status, "Proxy reload failed");
            return Err(ProxyError::Reload {
                command,
                reason: format!("{}: {}", output.status, stderr),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let r = CommandReloader::from_command_line("systemctl  restart xray", Duration::from_secs(1)).unwrap();
        assert_eq!(r.program, "systemctl");
        assert_eq!(r.args, vec!["restart", "xray"]);
        assert_eq!(r.command_line(), "systemctl restart xray");
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandReloader::from_command_line("   ", Duration::from_secs(1)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reload_reports_exit_status() {
        let ok = CommandReloader::from_command_line("true", Duration::from_secs(5)).unwrap();
        assert!(ok.reload().await.is_ok());

        let failing = CommandReloader::from_command_line("false", Duration::from_secs(5)).unwrap();
        assert!(matches!(failing.reload().await, Err(ProxyError::Reload { .. })));
    }
}
