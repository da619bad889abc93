//! # Courier Provisioning Tool
//!
//! Deployment pre-flight for a service: validates configuration, declares the service's
//! exchanges, queues and bindings on the broker, optionally binds topics, and exits.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use courier_bus::config::{BusConfig, ConfigLoader};
use courier_bus::dispatch::HandlerRegistry;
use courier_bus::logging::init_structured_logging;
use courier_bus::MessageBus;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "courier-provision")]
#[command(about = "Provision message bus topology for a service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (default: config/courier.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured service name
    #[arg(long)]
    service_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Declare the topology and bind topics (default)
    Provision {
        /// Routing keys to bind to the primary queue
        #[arg(short, long = "topic")]
        topics: Vec<String>,
    },

    /// Load and validate configuration without touching the broker
    Validate,

    /// Print the effective configuration with secrets masked
    ShowConfig,
}

fn load_config(cli: &Cli) -> anyhow::Result<BusConfig> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::new().with_file(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("failed to load configuration")?;
    if let Some(service_name) = &cli.service_name {
        config.service_name = service_name.clone();
        config.validate().context("invalid service name override")?;
    }
    Ok(config)
}

async fn provision(config: BusConfig, topics: &[String]) -> anyhow::Result<()> {
    info!(
        broker = %config.amqp_url_redacted(),
        service_name = %config.service_name,
        "Connecting to broker"
    );
    let bus = MessageBus::connect(config, HandlerRegistry::new())
        .await
        .context("failed to connect to broker")?;

    let result = async {
        bus.provision().await.context("topology provisioning failed")?;
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        bus.subscribe_all(Some(&topics))
            .await
            .context("topic binding failed")?;
        anyhow::Ok(topics.len())
    }
    .await;

    bus.disconnect().await.context("disconnect failed")?;
    let bound = result?;

    let topology = bus.topology();
    info!(
        service_exchange = %topology.service_exchange,
        primary_queue = %topology.primary_queue,
        retry_queue = %topology.retry_queue,
        topics_bound = bound,
        "Provisioning complete"
    );
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Some(Commands::Validate) => {
            println!("✓ configuration valid for service '{}'", config.service_name);
            Ok(())
        }
        Some(Commands::ShowConfig) => {
            println!("{}", serde_json::to_string_pretty(&config.sanitized())?);
            Ok(())
        }
        Some(Commands::Provision { topics }) => provision(config, &topics).await,
        None => provision(config, &[]).await,
    }
}

#[tokio::main]
async fn main() {
    init_structured_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "courier-provision failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
