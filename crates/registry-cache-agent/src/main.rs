use anyhow::{Context, Result};
use clap::Parser;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use registry_cache_agent::runtime::CommandRestarter;
use registry_cache_agent::{AgentCli, AgentConfig, LogFormat, NodeAgent};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AgentCli::parse();
    init_tracing(cli.log_format);

    let config = AgentConfig::from_cli(&cli).context("Invalid agent configuration")?;

    info!(
        input = %config.input.display(),
        host_root = %config.host_root.display(),
        imports_dir = %config.imports_dir,
        runtime_config = %config.runtime_config,
        service = %config.runtime_service,
        "registry-cache-agent starting"
    );

    let restarter = CommandRestarter::systemd(
        &config.host_root,
        &config.runtime_service,
        config.restart_timeout,
    );
    let mut agent = NodeAgent::new(config, restarter);
    agent.startup().context("Node agent start-up failed")?;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    select! {
        _ = agent.run() => {}
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false),
            )
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init(),
    }
}
