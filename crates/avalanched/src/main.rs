//! avalanched - Avalanche cache server daemon
//!
//! Serves the local blob store over TCP and replicates new blobs to every
//! server found through multicast discovery.

mod config;
mod node;

use anyhow::Result;
use clap::Parser;
use config::Config;
use node::Node;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "avalanched")]
#[command(about = "Distributed content-addressed blob cache server")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "AVALANCHE_CONFIG")]
    config: Option<PathBuf>,

    /// Write a default configuration and exit
    #[arg(long)]
    init: bool,

    /// Override the listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the blob directory
    #[arg(short, long)]
    blobs: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(config: &Config, debug: bool) {
    let level = if debug { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(args.config)?;
        println!("Configuration written to {}", config.config_path().display());
        return Ok(());
    }

    let mut config = Config::load(args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(blobs) = args.blobs {
        config.server.blobs_path = Some(blobs);
    }

    init_logging(&config, args.debug);
    info!("Using configuration {}", config.config_path().display());

    let node = Node::new(config).await?;
    node.run().await
}
