//! DEA execution agent
//!
//! Runs on each host and manages application instances for the control
//! plane. Configuration comes from `DEA_*` environment variables.
//!
//! ## Signals
//!
//! - **SIGTERM / Ctrl-C**: stop every instance and exit
//! - **SIGUSR2**: evacuate (publish exit notices), then shut down

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dea_agent::{Agent, AgentState, Config, LocalBus, MessageBus, ProcessLauncher, TaskDomainHost};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Grace period between SIGTERM and SIGKILL when stopping an instance.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = dea_agent::agent::VERSION, "Starting DEA");

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        node_id = %config.node_id,
        base_dir = %config.base_dir.display(),
        host = %config.host,
        max_memory_mb = config.max_memory_mb,
        max_clients = config.max_clients,
        runtimes = config.runtimes.len(),
        "Configuration loaded"
    );

    // No external transport is wired in; the local bus serves a single host.
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let launcher = Arc::new(ProcessLauncher::new(STOP_GRACE));
    let domains = Arc::new(TaskDomainHost::new(launcher.clone()));

    let agent = Agent::new(config, bus.clone(), domains, launcher)?;
    agent.start().await?;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigusr2 =
        signal(SignalKind::user_defined2()).context("failed to install SIGUSR2 handler")?;
    let mut state = agent.subscribe_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt");
                agent.shutdown().await;
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                agent.shutdown().await;
                break;
            }
            _ = sigusr2.recv() => {
                info!("Received SIGUSR2, evacuating");
                let agent = agent.clone();
                tokio::spawn(async move { agent.evacuate().await });
            }
            _ = state.wait_for(|s| *s == AgentState::Stopped) => break,
        }
    }

    bus.close();
    info!("DEA stopped");
    Ok(())
}
