//! Standalone harness runner: starts a coordinator and broker from a TOML
//! config (or defaults) and serves until Ctrl+C.

use brokerunit::{BrokerUnit, Config, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "brokerunit-server", about = "Run a standalone embedded broker")]
struct Cli {
    /// Path to a TOML config file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Coordinator port when no config file is given (0 = ephemeral).
    #[arg(long, default_value_t = 0)]
    coordinator_port: u16,

    /// Broker port when no config file is given (0 = ephemeral).
    #[arg(long, default_value_t = 0)]
    broker_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut unit = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {path}");
            let config = match Config::from_file(path) {
                Ok(config) => config,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            };
            BrokerUnit::from_config(config)
        }
        None => BrokerUnit::new(cli.coordinator_port, cli.broker_port),
    };

    unit.startup().await?;
    info!("Broker available at {}", unit.broker_connect()?);
    info!("Coordinator available at {}", unit.coordinator_connect()?);

    signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    info!("Received shutdown signal (Ctrl+C)");

    unit.shutdown().await?;
    Ok(())
}
