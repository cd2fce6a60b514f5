//! Cachefleet - self-scaling consistent-hashing load balancer
//!
//! Front-end balancer, autoscaling cache-server manager, and telemetry
//! monitor in one co-located process. Clients talk to the balancer port;
//! operators talk to the control API it publishes at startup.

use cachefleet::{config, BalancerServer, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "cachefleet")]
#[command(about = "Self-scaling consistent-hashing cache load balancer", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "CACHEFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CACHEFLEET_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the balancer
    Start {
        /// Listener host
        #[arg(long)]
        host: Option<String>,

        /// Client-facing port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.client_port = port;
            }

            info!(
                "cachefleet v{} starting on {}:{}",
                env!("CARGO_PKG_VERSION"),
                config.server.host,
                config.server.client_port
            );

            let server = BalancerServer::new(config)?;

            let token = CancellationToken::new();
            let signal_token = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    signal_token.cancel();
                }
            });

            server.run(token).await?;
        },

        Commands::Validate {
            config: config_path,
        } => match config::Config::validate_file(&config_path) {
            Ok(_) => {
                println!("Configuration valid");
            },
            Err(e) => {
                eprintln!("Configuration errors found:");
                eprintln!("{}", e);
                std::process::exit(1);
            },
        },
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<config::Config> {
    match path {
        Some(path) => config::Config::from_file(path),
        None => config::Config::discover_and_load(),
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}
