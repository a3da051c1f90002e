use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tether_core::Agent;
use tether_core::AgentConfig;
use tether_core::inspector::LogInspector;
use tether_core::telemetry::SysinfoTelemetry;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Agent that maintains a heartbeat control channel to an orchestration
/// server and runs shell sessions on its behalf.
#[derive(Debug, Parser)]
#[command(name = "tether", version)]
struct Cli {
    /// Bearer token echoed in every heartbeat.
    #[arg(long = "token", env = "CLI_TOKEN", hide_env_values = true)]
    cli_token: Option<String>,

    /// Absolute URL of the heartbeat endpoint.
    #[arg(long = "server-url", env = "SERVER_URL")]
    server_url: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = AgentConfig {
        cli_token: cli.cli_token,
        server_url: cli.server_url,
        ..AgentConfig::from_env()
    };
    if config.credentials().is_err() {
        // Not fatal: heartbeats are recorded as failed until both values
        // are present.
        info!("CLI_TOKEN and/or SERVER_URL missing; agent will idle");
    }

    let mut agent = Agent::with_providers(
        config,
        Arc::new(SysinfoTelemetry::new()),
        Arc::new(LogInspector),
    )?;

    tokio::select! {
        _ = agent.run() => {}
        _ = shutdown_signal() => {
            info!("termination signal received; shutting down");
        }
    }
    agent.shutdown();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
