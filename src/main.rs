//! Fleet Node Agent
//!
//! Runs on every edge node next to the proxy. Registers the node with the
//! control plane, then keeps health, traffic and the authorized-user set in
//! sync until it receives SIGINT/SIGTERM.
//!
//! # Usage
//! ```bash
//! MAIN_SERVER_URL=https://cp.example.com/api/v1/nodes \
//! NODE_API_KEY=... NODE_IP=203.0.113.10 \
//!   node-agent --log-json
//!
//! # Cron mode: register, one pass of every loop, exit
//! node-agent --once
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fleet_node_agent::{AgentArgs, AgentConfig, Supervisor};

#[tokio::main]
async fn main() {
    let args = AgentArgs::parse();
    init_tracing(args.log_json, args.verbose);

    if let Err(e) = run(args).await {
        error!(error = %format!("{:#}", e), "Node agent exited with error");
        std::process::exit(1);
    }
}

async fn run(args: AgentArgs) -> Result<()> {
    let config = AgentConfig::from_args(args).context("Invalid configuration")?;
    let once = config.once;

    info!(
        server = %config.server_url,
        node_name = %config.identity.name,
        inbound = %config.inbound_tag,
        state = %config.state_path.display(),
        once,
        "Starting node agent"
    );

    let supervisor = Supervisor::from_config(config)?;
    let summaries = supervisor.run(shutdown_signal()).await?;

    if once {
        let failed: Vec<_> = summaries.iter().filter(|s| s.failed()).map(|s| s.name).collect();
        if !failed.is_empty() {
            anyhow::bail!("one-shot run failed for: {}", failed.join(", "));
        }
    }

    info!("Node agent stopped");
    Ok(())
}

fn init_tracing(json: bool, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
