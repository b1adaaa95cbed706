// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Stampede master daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stampede_core::aggregator::Aggregator;
use stampede_core::api::{self, ApiState};
use stampede_core::bus::{MemoryBus, RedisBus, ResultBus};
use stampede_core::config::MasterConfig;
use stampede_core::coordinator::LifecycleCoordinator;
use stampede_core::dispatch::HttpDispatcher;
use stampede_core::registry::FleetRegistry;
use stampede_core::server::WorkerEndpoint;
use stampede_core::store::{MemoryStore, ResultStore, TestStore};

#[derive(Parser)]
#[command(name = "stampede", version, about = "Distributed HTTP load-test master")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the master daemon
    Serve {
        /// Path to a TOML configuration file
        #[arg(short, long, env = "STAMPEDE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration and exit
    Config {
        /// Path to a TOML configuration file
        #[arg(short, long, env = "STAMPEDE_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Config { config } => {
            let cfg = MasterConfig::load(config.as_deref())?;
            let rendered =
                serde_json::to_string_pretty(&cfg).context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

struct Stores {
    tests: Arc<dyn TestStore>,
    results: Arc<dyn ResultStore>,
}

async fn build_stores(cfg: &MasterConfig) -> Result<Stores> {
    if cfg.database.url.is_empty() {
        info!("no database configured; running on the in-memory store");
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            tests: store.clone(),
            results: store,
        });
    }

    #[cfg(feature = "database")]
    {
        let store = Arc::new(
            stampede_core::store::PostgresStore::connect(&cfg.database.url).await?,
        );
        Ok(Stores {
            tests: store.clone(),
            results: store,
        })
    }
    #[cfg(not(feature = "database"))]
    {
        anyhow::bail!(
            "database.url is set but this binary was built without the `database` feature"
        )
    }
}

async fn build_bus(cfg: &MasterConfig) -> Result<Arc<dyn ResultBus>> {
    if cfg.bus.url.is_empty() {
        info!("no bus configured; running on the in-process bus");
        return Ok(Arc::new(MemoryBus::new()));
    }
    let bus = RedisBus::connect(&cfg.bus.url, &cfg.bus.topic)
        .await
        .context("failed to connect to the result bus")?;
    Ok(Arc::new(bus))
}

async fn serve(config: Option<PathBuf>) -> Result<()> {
    let cfg = MasterConfig::load(config.as_deref())?;
    info!(
        worker_listen = %cfg.server.worker_listen,
        http_listen = %cfg.server.http_listen,
        "starting stampede master"
    );

    let stores = build_stores(&cfg).await?;
    let bus = build_bus(&cfg).await?;

    let registry = Arc::new(FleetRegistry::new());
    let dispatcher = Arc::new(HttpDispatcher::new(std::time::Duration::from_secs(
        cfg.dispatch.timeout_secs,
    ))?);
    let aggregator = Arc::new(Aggregator::new(
        stores.tests.clone(),
        stores.results.clone(),
    ));
    let coordinator = Arc::new(LifecycleCoordinator::new(
        registry.clone(),
        stores.tests.clone(),
        dispatcher,
        aggregator.clone(),
        cfg.lifecycle.clone(),
        cfg.scheduler.clone(),
    ));

    // Bus consume loop
    let consume_group = cfg.bus.group.clone();
    let consume_bus = bus.clone();
    let consume_aggregator = aggregator.clone();
    let consumer_task = tokio::spawn(async move {
        if let Err(err) = consume_aggregator.run(consume_bus, &consume_group).await {
            tracing::error!(%err, "aggregator consume loop ended");
        }
    });

    // Lifecycle sweeper
    let tick_task = coordinator.clone().spawn_tick_loop();

    // Worker protocol endpoint
    let worker_endpoint = Arc::new(WorkerEndpoint::new(registry.clone(), coordinator.clone()));
    let worker_listener = tokio::net::TcpListener::bind(&cfg.server.worker_listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.worker_listen))?;
    let worker_server = tokio::spawn(async move {
        if let Err(err) = axum::serve(worker_listener, worker_endpoint.router()).await {
            tracing::error!(%err, "worker endpoint stopped");
        }
    });

    // Submission surface
    let api_state = Arc::new(ApiState {
        coordinator: coordinator.clone(),
        registry: registry.clone(),
        tests: stores.tests.clone(),
        results: stores.results.clone(),
        aggregation: aggregator,
    });
    let http_listener = tokio::net::TcpListener::bind(&cfg.server.http_listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.http_listen))?;
    let http_server = tokio::spawn(async move {
        if let Err(err) = axum::serve(http_listener, api::router(api_state)).await {
            tracing::error!(%err, "http surface stopped");
        }
    });

    info!("stampede master running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    consumer_task.abort();
    tick_task.abort();
    worker_server.abort();
    http_server.abort();
    Ok(())
}
