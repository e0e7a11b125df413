//! swarmd — coordination backend for LLM specialist swarms.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use swarmd_bus::EventBus;
use swarmd_coord::{
    InstanceConfig, InstanceManager, SamplingClient, SamplingConfig, SwarmCoordinator, TaskQueue,
};
use swarmd_hooks::HookValidator;
use swarmd_rpc::{RpcServer, SwarmContext};
use swarmd_store::{Sink, Store, StoreConfig};

use crate::config::SwarmdConfig;

#[derive(Parser)]
#[command(name = "swarmd", version, about = "Coordination backend for LLM specialist swarms")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Override SWARMD_BIND.
    #[arg(long, global = true)]
    bind: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (the default).
    Serve,
    /// Print the resolved configuration and exit.
    CheckConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = SwarmdConfig::from_env()?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    init_tracing(config.log_json);

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            println!("{config:#?}");
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: SwarmdConfig) -> Result<()> {
    info!(bind = %config.bind, "starting swarmd");

    let store = Store::new(StoreConfig {
        stream_cap: config.stream_cap,
    });
    let sink = if config.sink_path == ":memory:" {
        Sink::open_in_memory()
    } else {
        Sink::open(&config.sink_path)
    }
    .context("failed to open relational sink")?;

    let mut sampling_config = SamplingConfig::new(config.sampling_url.clone());
    sampling_config.request_timeout = config.sampling_timeout;
    sampling_config.max_attempts = config.sampling_attempts;
    let sampling = SamplingClient::new(sampling_config).context("failed to build sampling client")?;

    let bus = EventBus::new(store.clone());
    let queue = TaskQueue::new(store.clone());
    let instances = InstanceManager::new(
        store.clone(),
        InstanceConfig {
            offline_after: config.offline_after,
            sweep_interval: config.sweep_interval,
            evict_after: config.evict_after,
            default_max_load: config.default_max_load,
        },
    );
    let coordinator = SwarmCoordinator::new(store.clone(), sink.clone(), sampling)
        .context("failed to build coordinator")?;
    let hooks = HookValidator::new(store.clone()).context("failed to build hook validator")?;

    let sweeper = instances.start_sweeper();

    let ctx = SwarmContext::new(
        store,
        sink,
        bus,
        queue,
        instances.clone(),
        coordinator,
        hooks,
        config.flush_token.clone(),
    );
    let server = RpcServer::new(ctx);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    tokio::select! {
        result = server.serve(listener) => {
            result.context("server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    instances.shutdown();
    sweeper.await.ok();
    info!("swarmd stopped");
    Ok(())
}
