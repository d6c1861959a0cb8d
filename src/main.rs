use clap::Parser;
use conductor_core::{
    agents::AgentRegistry,
    api::ApiServer,
    config::Config,
    scheduler::{recovery, SchedulerRegistry},
    store::QueueStore,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Task queue engine for multi-agent coordination.
#[derive(Debug, Parser)]
#[command(name = "conductor-core", version)]
struct Cli {
    /// Bind address for the control API (overrides CONDUCTOR_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port for the control API (overrides CONDUCTOR_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Queue store URL, e.g. redis://127.0.0.1:6379 (overrides
    /// CONDUCTOR_STORE_URL; empty selects the in-memory fallback)
    #[arg(long)]
    store_url: Option<String>,

    /// Verbose logging (overrides CONDUCTOR_DEBUG)
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let debug_mode = cli.debug
        || matches!(
            std::env::var("CONDUCTOR_DEBUG").as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        );
    let default_filter = if debug_mode {
        "conductor_core=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    info!("Starting Conductor Core task queue engine");

    let mut config = Config::load()?;
    if let Some(host) = cli.host {
        config.api.host = host;
    }
    if let Some(port) = cli.port {
        config.api.port = port;
    }
    if let Some(store_url) = cli.store_url {
        config.store.endpoint = store_url;
    }
    if debug_mode {
        config.debug_mode = true;
    }

    // An unreachable required store is the one fatal startup condition.
    let store = QueueStore::connect(&config.store).await?;

    // Interrupted queues are re-normalized before the API takes traffic.
    recovery::recover_interrupted_queues(&store).await?;

    let agents = Arc::new(AgentRegistry::from_agents(config.agents.agents.clone()));
    info!("Registered {} worker agents", agents.len());

    let schedulers = Arc::new(SchedulerRegistry::new());
    let api_server = ApiServer::new(config, store.clone(), agents, schedulers.clone());

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!("Control API failed: {e}");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received; stopping active schedulers");
            schedulers.stop_all();
            store.disconnect();
        }
    }

    Ok(())
}
